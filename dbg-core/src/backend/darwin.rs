/*
    allocscope  -  a memory tracking tool
    Copyright (C) 2023  Matt Kimball

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

//! Exception-port-style backend for macOS.
//!
//! There is no MIG toolchain in this workspace to generate the usual
//! `mach_exc_server` demuxer, so the Mach exception request is parsed by
//! hand off the wire format instead of through generated glue: a
//! `mach_msg_header_t` followed by a body carrying `exception_type_t`,
//! a code count, and up to two `mach_exception_data_type_t` words. This
//! mirrors the layout MIG itself would unpack, just without the
//! generated switch statement.

use crate::backend::{ProcessBackend, WaitEvent};
use crate::error::DebugError;
use crate::register::Register;
use mach2::exception_types::{EXC_BREAKPOINT, EXC_MASK_ALL, EXC_SOFTWARE, EXC_SOFT_SIGNAL};
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_types::{task_t, thread_act_t};
use mach2::message::{
    mach_msg, mach_msg_header_t, MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MAKE_SEND,
    MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_allocate, mach_port_deallocate, mach_port_insert_right, mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::task::{task_resume, task_suspend};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_protect, mach_vm_read_overwrite, mach_vm_write};
use mach2::vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
use mach2::vm_types::mach_vm_address_t;
use std::cell::Cell;
use std::mem;

const STEP_FLAG: u64 = 0x100;

thread_local! {
    /// The only acceptable mutable global here, scoped per-thread and
    /// live only while a wait is dispatching an exception message.
    static CURRENT_BACKEND: Cell<*mut DarwinBackend> = Cell::new(std::ptr::null_mut());
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct X86ThreadState64 {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rdi: u64,
    rsi: u64,
    rbp: u64,
    rsp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    rflags: u64,
    cs: u64,
    fs: u64,
    gs: u64,
}

const X86_THREAD_STATE64: i32 = 4;
const X86_THREAD_STATE64_COUNT: u32 =
    (mem::size_of::<X86ThreadState64>() / mem::size_of::<u32>()) as u32;

fn mach_check(result: kern_return_t, context: &str) -> Result<(), DebugError> {
    if result != KERN_SUCCESS {
        Err(crate::error::mach_error(result, context))
    } else {
        Ok(())
    }
}

struct PreviousExceptionPorts {
    task: task_t,
    count: u32,
    masks: [u32; 32],
    ports: [mach_port_t; 32],
    behaviors: [u32; 32],
    flavors: [u32; 32],
}

impl PreviousExceptionPorts {
    fn capture(task: task_t) -> Result<PreviousExceptionPorts, DebugError> {
        let mut state = PreviousExceptionPorts {
            task,
            count: 0,
            masks: [0; 32],
            ports: [MACH_PORT_NULL; 32],
            behaviors: [0; 32],
            flavors: [0; 32],
        };

        let result = unsafe {
            mach2::exc::task_get_exception_ports(
                task,
                EXC_MASK_ALL,
                state.masks.as_mut_ptr(),
                &mut state.count,
                state.ports.as_mut_ptr(),
                state.behaviors.as_mut_ptr(),
                state.flavors.as_mut_ptr(),
            )
        };
        mach_check(result, "task_get_exception_ports")?;
        Ok(state)
    }

    fn restore(&self) -> Result<(), DebugError> {
        for i in 0..self.count as usize {
            let result = unsafe {
                mach2::exc::task_set_exception_ports(
                    self.task,
                    self.masks[i],
                    self.ports[i],
                    self.behaviors[i],
                    self.flavors[i],
                )
            };
            mach_check(result, "task_set_exception_ports")?;
        }
        Ok(())
    }
}

pub struct DarwinBackend {
    pid: u32,
    task: task_t,
    thread: thread_act_t,
    exception_port: mach_port_t,
    registers: X86ThreadState64,
    registers_dirty: bool,
    old_exceptions: Option<PreviousExceptionPorts>,
    pending_signal: i32,
    exited: Option<WaitEvent>,
}

impl DarwinBackend {
    fn attach_task(pid: u32) -> Result<DarwinBackend, DebugError> {
        let mut task: task_t = MACH_PORT_NULL;
        let result = unsafe { task_for_pid(mach_task_self(), pid as i32, &mut task) };
        mach_check(result, "task_for_pid")?;

        let result = unsafe { task_suspend(task) };
        mach_check(result, "task_suspend")?;

        let mut exception_port: mach_port_t = MACH_PORT_NULL;
        let result = unsafe {
            mach_port_allocate(mach_task_self(), MACH_PORT_RIGHT_RECEIVE, &mut exception_port)
        };
        mach_check(result, "mach_port_allocate")?;
        let result = unsafe {
            mach_port_insert_right(
                mach_task_self(),
                exception_port,
                exception_port,
                MACH_MSG_TYPE_MAKE_SEND,
            )
        };
        mach_check(result, "mach_port_insert_right")?;

        let old_exceptions = PreviousExceptionPorts::capture(task)?;

        let result = unsafe {
            mach2::exc::task_set_exception_ports(
                task,
                EXC_MASK_ALL,
                exception_port,
                mach2::exception_types::EXCEPTION_DEFAULT | mach2::exception_types::MACH_EXCEPTION_CODES,
                0,
            )
        };
        mach_check(result, "task_set_exception_ports")?;

        let threads = task_threads(task)?;
        let thread = *threads
            .first()
            .ok_or_else(|| DebugError::Internal("target task has no threads".into()))?;

        unsafe {
            if libc::ptrace(libc::PT_ATTACHEXC, pid as i32, std::ptr::null_mut(), 0) != 0 {
                return Err(DebugError::from_errno());
            }
        }

        Ok(DarwinBackend {
            pid,
            task,
            thread,
            exception_port,
            registers: X86ThreadState64::default(),
            registers_dirty: true,
            old_exceptions: Some(old_exceptions),
            pending_signal: 0,
            exited: None,
        })
    }

    fn load_registers(&mut self) -> Result<(), DebugError> {
        if self.registers_dirty {
            let mut count = X86_THREAD_STATE64_COUNT;
            let result = unsafe {
                mach2::thread_act::thread_get_state(
                    self.thread,
                    X86_THREAD_STATE64,
                    &mut self.registers as *mut _ as *mut u32,
                    &mut count,
                )
            };
            mach_check(result, "thread_get_state")?;
            self.registers_dirty = false;
        }
        Ok(())
    }

    fn store_registers(&mut self) -> Result<(), DebugError> {
        let result = unsafe {
            mach2::thread_act::thread_set_state(
                self.thread,
                X86_THREAD_STATE64,
                &self.registers as *const _ as *mut u32,
                X86_THREAD_STATE64_COUNT,
            )
        };
        if result != KERN_SUCCESS {
            self.registers_dirty = true;
            return Err(crate::error::mach_error(result, "thread_set_state"));
        }
        Ok(())
    }

    /// Suspend-count-based idempotency: if the target was already
    /// suspended, undo the extra bump so repeated `interrupt()` calls don't
    /// accumulate suspensions.
    fn interrupt_impl(&mut self) -> Result<(), DebugError> {
        let result = unsafe { task_suspend(self.task) };
        mach_check(result, "task_suspend")?;

        let mut info: mach2::task_info::task_basic_info = unsafe { mem::zeroed() };
        let mut count = mach2::task_info::TASK_BASIC_INFO_COUNT;
        let result = unsafe {
            mach2::task::task_info(
                self.task,
                mach2::task_info::TASK_BASIC_INFO,
                &mut info as *mut _ as *mut i32,
                &mut count,
            )
        };
        mach_check(result, "task_info")?;

        if info.suspend_count > 1 {
            let result = unsafe { task_resume(self.task) };
            mach_check(result, "task_resume")?;
        }
        Ok(())
    }

    /// Receive and dispatch a single Mach exception message, hand-decoding
    /// the wire layout a generated `mach_exc_server` would otherwise unpack
    /// (see module doc comment).
    fn process_exception_message(&mut self) -> Result<Option<WaitEvent>, DebugError> {
        #[repr(C)]
        struct Request {
            header: mach_msg_header_t,
            body: [u8; 256],
        }

        let mut request: Request = unsafe { mem::zeroed() };
        let result = unsafe {
            mach_msg(
                &mut request.header,
                MACH_RCV_MSG,
                0,
                mem::size_of::<Request>() as u32,
                self.exception_port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if result != KERN_SUCCESS {
            return Err(crate::error::mach_error(result, "mach_msg recv"));
        }

        CURRENT_BACKEND.with(|cell| cell.set(self as *mut DarwinBackend));
        let outcome = self.dispatch_exception_body(&request.body);
        CURRENT_BACKEND.with(|cell| cell.set(std::ptr::null_mut()));

        // A minimal success reply is sufficient to let the kernel resume
        // exception delivery; we never actually alter thread state through
        // the reply path (we use thread_set_state directly instead).
        let mut reply = request.header;
        reply.msgh_bits = reply.msgh_bits & 0xff;
        reply.msgh_remote_port = reply.msgh_remote_port;
        reply.msgh_local_port = MACH_PORT_NULL;
        unsafe {
            mach_msg(
                &mut reply,
                MACH_SEND_MSG,
                mem::size_of::<mach_msg_header_t>() as u32,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );
        }

        outcome
    }

    /// Body layout after the header: `exception_type_t exception`,
    /// `mach_msg_type_number_t code_count`, `mach_exception_data_type_t
    /// code[code_count]`. We only ever care about the first two codes.
    fn dispatch_exception_body(&mut self, body: &[u8]) -> Result<Option<WaitEvent>, DebugError> {
        if body.len() < 8 {
            return Ok(None);
        }
        let exception = i32::from_ne_bytes(body[0..4].try_into().unwrap());
        let code_count = u32::from_ne_bytes(body[4..8].try_into().unwrap());

        let mut codes = [0i64; 2];
        for (i, code) in codes.iter_mut().enumerate() {
            if (i as u32) < code_count {
                let offset = 8 + i * 8;
                if body.len() >= offset + 8 {
                    *code = i64::from_ne_bytes(body[offset..offset + 8].try_into().unwrap());
                }
            }
        }

        match exception {
            EXC_SOFTWARE if codes[0] == EXC_SOFT_SIGNAL as i64 => {
                let signal = codes[1] as i32;
                let (deliver, event) = match signal {
                    libc::SIGSTOP => (0, None),
                    libc::SIGINT => (0, Some(WaitEvent::Signal(signal))),
                    other => (other, Some(WaitEvent::Signal(other))),
                };
                unsafe {
                    libc::ptrace(
                        libc::PT_THUPDATE,
                        self.pid as i32,
                        self.thread as *mut libc::c_void,
                        deliver,
                    );
                }
                Ok(event)
            }
            EXC_BREAKPOINT if codes[0] == 2 => {
                // Leave the PC untouched here: `Debugger::dispatch` applies
                // `Cpu::on_breakpoint_hit`'s rewind uniformly for every
                // backend once the event reaches the facade. Rewinding here
                // too would double-decrement it. Likewise, `step`/`go`
                // already suspend the task unconditionally once
                // `wait_for_event` returns, so no extra `task_suspend` is
                // needed here: the caller-side suspend already covers the
                // "if trap flag not set, suspend" requirement.
                Ok(Some(WaitEvent::BreakpointHit))
            }
            _ => Ok(Some(WaitEvent::Signal(0))),
        }
    }

    fn wait_for_event(&mut self) -> Result<WaitEvent, DebugError> {
        loop {
            // EVFILT_PROC/kqueue multiplexing degrades, in the absence of a
            // generated demuxer loop, to polling process liveness between
            // blocking receives on the exception port; the exception port
            // itself is almost always what's ready.
            if !process_alive(self.pid) {
                return Ok(WaitEvent::Exited(0));
            }

            if let Some(event) = self.process_exception_message()? {
                return Ok(event);
            }
        }
    }
}

fn task_threads(task: task_t) -> Result<Vec<thread_act_t>, DebugError> {
    let mut threads: *mut thread_act_t = std::ptr::null_mut();
    let mut count: u32 = 0;
    let result = unsafe { mach2::task::task_threads(task, &mut threads, &mut count) };
    mach_check(result, "task_threads")?;

    let list = unsafe { std::slice::from_raw_parts(threads, count as usize).to_vec() };
    unsafe {
        mach2::vm::mach_vm_deallocate(
            mach_task_self() as u64,
            threads as u64,
            (count as usize * mem::size_of::<thread_act_t>()) as u64,
        );
    }
    Ok(list)
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

impl ProcessBackend for DarwinBackend {
    fn attach(pid: u32) -> Result<DarwinBackend, DebugError> {
        DarwinBackend::attach_task(pid)
    }

    fn create(argv: &[String]) -> Result<DarwinBackend, DebugError> {
        if argv.is_empty() {
            return Err(DebugError::InvalidArgument("empty argv".into()));
        }

        let mut cstrings: Vec<std::ffi::CString> = Vec::new();
        let mut args: Vec<*mut libc::c_char> = Vec::new();
        for arg in argv {
            let cstring = std::ffi::CString::new(arg.clone())
                .map_err(|_| DebugError::InvalidArgument("argv contains NUL".into()))?;
            args.push(cstring.as_ptr() as *mut libc::c_char);
            cstrings.push(cstring);
        }
        args.push(std::ptr::null_mut());

        let mut pid: libc::pid_t = 0;
        let result = unsafe {
            libc::posix_spawnp(
                &mut pid,
                args[0],
                std::ptr::null(),
                std::ptr::null(),
                args.as_ptr(),
                std::ptr::null(),
            )
        };
        if result != 0 {
            return Err(DebugError::os_error(result));
        }

        match DarwinBackend::attach_task(pid as u32) {
            Ok(backend) => Ok(backend),
            Err(err) => {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                Err(err)
            }
        }
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
        let mut read_count: u64 = 0;
        let result = unsafe {
            mach_vm_read_overwrite(
                self.task,
                addr,
                buf.len() as u64,
                buf.as_mut_ptr() as mach_vm_address_t,
                &mut read_count,
            )
        };
        mach_check(result, "mach_vm_read_overwrite")?;

        if (read_count as usize) < buf.len() {
            for byte in &mut buf[read_count as usize..] {
                *byte = 0;
            }
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, buf: &[u8]) -> Result<(), DebugError> {
        let result = unsafe { mach_vm_write(self.task, addr, buf.as_ptr() as mach_vm_address_t, buf.len() as u32) };
        if result == KERN_SUCCESS {
            return Ok(());
        }

        // Widen protection on the touched pages, preserving W^X by
        // stripping execute whenever we add write, then retry.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
        let aligned_addr = addr & !(page_size - 1);
        let aligned_end = (addr + buf.len() as u64 + page_size - 1) & !(page_size - 1);
        let aligned_size = aligned_end - aligned_addr;

        let mut restore: Vec<(u64, u64, vm_prot_t)> = Vec::new();
        let mut cursor = aligned_addr;
        while cursor < aligned_end {
            let mut region_addr = cursor;
            let mut region_size = page_size;
            let mut info: vm_region_basic_info_64 = unsafe { mem::zeroed() };
            let mut info_count = mem::size_of::<vm_region_basic_info_64>() as u32 / mem::size_of::<u32>() as u32;
            let mut object_name: mach_port_t = MACH_PORT_NULL;

            let result = unsafe {
                mach2::vm::mach_vm_region(
                    self.task,
                    &mut region_addr,
                    &mut region_size,
                    VM_REGION_BASIC_INFO_64,
                    &mut info as *mut _ as *mut i32,
                    &mut info_count,
                    &mut object_name,
                )
            };
            if object_name != MACH_PORT_NULL {
                unsafe {
                    mach_port_deallocate(mach_task_self(), object_name);
                }
            }
            mach_check(result, "mach_vm_region")?;

            if info.protection & VM_PROT_WRITE == 0 {
                let clamp_start = region_addr.max(aligned_addr);
                let clamp_end = (region_addr + region_size).min(aligned_end);
                restore.push((clamp_start, clamp_end - clamp_start, info.protection));
            }

            cursor = region_addr + region_size;
        }

        if restore.is_empty() {
            return Err(crate::error::mach_error(result, "mach_vm_write"));
        }

        for (region_addr, region_size, prot) in &restore {
            let new_prot = (*prot & !VM_PROT_EXECUTE) | VM_PROT_WRITE;
            let result = unsafe { mach_vm_protect(self.task, *region_addr, *region_size, 0, new_prot) };
            mach_check(result, "mach_vm_protect (widen)")?;
        }

        let result = unsafe { mach_vm_write(self.task, addr, buf.as_ptr() as mach_vm_address_t, buf.len() as u32) };
        let write_result = mach_check(result, "mach_vm_write (retry)");

        for (region_addr, region_size, prot) in &restore {
            unsafe {
                mach_vm_protect(self.task, *region_addr, *region_size, 0, *prot);
            }
        }

        write_result
    }

    fn get_register(&mut self, register: Register) -> Result<u64, DebugError> {
        self.load_registers()?;
        Ok(register_field(&self.registers, register))
    }

    fn set_register(&mut self, register: Register, value: u64) -> Result<(), DebugError> {
        self.load_registers()?;
        set_register_field(&mut self.registers, register, value);
        self.store_registers()
    }

    fn step(&mut self) -> Result<WaitEvent, DebugError> {
        self.load_registers()?;
        let had_step = self.registers.rflags & STEP_FLAG != 0;
        if !had_step {
            self.registers.rflags |= STEP_FLAG;
            self.store_registers()?;
        }

        let threads = task_threads(self.task)?;
        for &thread in &threads {
            if thread != self.thread {
                unsafe {
                    mach2::thread_act::thread_suspend(thread);
                }
            }
        }

        self.registers_dirty = true;
        let result = unsafe { task_resume(self.task) };
        mach_check(result, "task_resume")?;

        let event = self.wait_for_event()?;

        let result = unsafe { task_suspend(self.task) };
        mach_check(result, "task_suspend")?;

        for &thread in &threads {
            if thread != self.thread {
                unsafe {
                    mach2::thread_act::thread_resume(thread);
                }
            }
        }

        if !had_step {
            self.load_registers()?;
            self.registers.rflags &= !STEP_FLAG;
            self.store_registers()?;
        }

        Ok(event)
    }

    fn go(&mut self) -> Result<WaitEvent, DebugError> {
        self.registers_dirty = true;
        let result = unsafe { task_resume(self.task) };
        mach_check(result, "task_resume")?;
        let event = self.wait_for_event()?;
        let result = unsafe { task_suspend(self.task) };
        mach_check(result, "task_suspend")?;
        Ok(event)
    }

    fn interrupt(&mut self) -> Result<(), DebugError> {
        self.interrupt_impl()
    }

    fn detach(&mut self) -> Result<(), DebugError> {
        unsafe {
            libc::ptrace(libc::PT_DETACH, self.pid as i32, std::ptr::null_mut(), 0);
        }
        if let Some(old) = self.old_exceptions.take() {
            old.restore()?;
        }
        let result = unsafe { task_resume(self.task) };
        mach_check(result, "task_resume")?;
        Ok(())
    }

    fn quit(&mut self) -> Result<(), DebugError> {
        unsafe {
            if libc::kill(self.pid as i32, libc::SIGTERM) != 0 {
                return Err(DebugError::from_errno());
            }
        }
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for DarwinBackend {
    fn drop(&mut self) {
        unsafe {
            mach_port_deallocate(mach_task_self(), self.exception_port);
            mach_port_deallocate(mach_task_self(), self.thread);
            mach_port_deallocate(mach_task_self(), self.task);
        }
    }
}

fn register_field(regs: &X86ThreadState64, register: Register) -> u64 {
    match register {
        Register::Ax => regs.rax,
        Register::Bx => regs.rbx,
        Register::Cx => regs.rcx,
        Register::Dx => regs.rdx,
        Register::Si => regs.rsi,
        Register::Di => regs.rdi,
        Register::Sp => regs.rsp,
        Register::Bp => regs.rbp,
        Register::Ip => regs.rip,
        Register::Flags => regs.rflags,
        Register::R8 => regs.r8,
        Register::R9 => regs.r9,
        Register::R10 => regs.r10,
        Register::R11 => regs.r11,
        Register::R12 => regs.r12,
        Register::R13 => regs.r13,
        Register::R14 => regs.r14,
        Register::R15 => regs.r15,
    }
}

fn set_register_field(regs: &mut X86ThreadState64, register: Register, value: u64) {
    match register {
        Register::Ax => regs.rax = value,
        Register::Bx => regs.rbx = value,
        Register::Cx => regs.rcx = value,
        Register::Dx => regs.rdx = value,
        Register::Si => regs.rsi = value,
        Register::Di => regs.rdi = value,
        Register::Sp => regs.rsp = value,
        Register::Bp => regs.rbp = value,
        Register::Ip => regs.rip = value,
        Register::Flags => regs.rflags = value,
        Register::R8 => regs.r8 = value,
        Register::R9 => regs.r9 = value,
        Register::R10 => regs.r10 = value,
        Register::R11 => regs.r11 = value,
        Register::R12 => regs.r12 = value,
        Register::R13 => regs.r13 = value,
        Register::R14 => regs.r14 = value,
        Register::R15 => regs.r15 = value,
    }
}
