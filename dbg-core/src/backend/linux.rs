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

use crate::backend::{ProcessBackend, WaitEvent};
use crate::error::DebugError;
use crate::process_map::ProcessMap;
use crate::register::Register;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::ptr;

/// Which primitive was used for the most recent resume. Required so that a
/// transparently-swallowed signal (SIGCHLD, SIGTTIN, SIGTTOU) is
/// re-continued with the *same* mode rather than silently upgrading an
/// in-flight single-step into a full continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    Step,
    Continue,
}

/// ptrace-based backend for Linux.
pub struct LinuxBackend {
    pid: u32,
    registers: libc::user_regs_struct,
    registers_dirty: bool,
    pending_signal: i32,
    last_step: StepMode,
    mem_fd: Option<File>,
}

fn errno_result<T>(value: i64) -> Result<T, DebugError>
where
    T: TryFrom<i64>,
{
    if value == -1 {
        Err(DebugError::from_errno())
    } else {
        T::try_from(value).map_err(|_| DebugError::Internal("ptrace result out of range".into()))
    }
}

fn ptrace_unit(request: i32, pid: u32, addr: u64, data: u64) -> Result<i64, DebugError> {
    unsafe {
        *libc::__errno_location() = 0;
        let result = libc::ptrace(request, pid, addr as *mut libc::c_void, data as *mut libc::c_void);
        if result == -1 && *libc::__errno_location() != 0 {
            Err(DebugError::from_errno())
        } else {
            Ok(result as i64)
        }
    }
}

impl LinuxBackend {
    fn open_mem_fd(pid: u32) -> Option<File> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .ok()
    }

    fn load_registers(&mut self) -> Result<(), DebugError> {
        if self.registers_dirty {
            unsafe {
                let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed();
                if libc::ptrace(
                    libc::PTRACE_GETREGS,
                    self.pid,
                    ptr::null_mut::<libc::c_void>(),
                    regs.as_mut_ptr(),
                ) == -1
                {
                    return Err(DebugError::from_errno());
                }
                self.registers = regs.assume_init();
            }
            self.registers_dirty = false;
        }
        Ok(())
    }

    fn store_registers(&mut self) -> Result<(), DebugError> {
        let result = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGS,
                self.pid,
                ptr::null_mut::<libc::c_void>(),
                &self.registers,
            )
        };
        if result == -1 {
            self.registers_dirty = true;
            return Err(DebugError::from_errno());
        }
        Ok(())
    }

    fn peektext(&self, addr: u64) -> Result<u64, DebugError> {
        unsafe {
            *libc::__errno_location() = 0;
            let word = libc::ptrace(
                libc::PTRACE_PEEKTEXT,
                self.pid,
                addr as *mut libc::c_void,
                ptr::null_mut::<libc::c_void>(),
            );
            if word == -1 && *libc::__errno_location() != 0 {
                Err(DebugError::from_errno())
            } else {
                Ok(word as u64)
            }
        }
    }

    fn poketext(&self, addr: u64, value: u64) -> Result<(), DebugError> {
        let result = unsafe {
            libc::ptrace(
                libc::PTRACE_POKETEXT,
                self.pid,
                addr as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        if result == -1 {
            Err(DebugError::from_errno())
        } else {
            Ok(())
        }
    }

    fn read_memory_words(&self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let word_addr = addr + offset as u64;
            let aligned = word_addr & !7;
            let shift = (word_addr & 7) as usize;
            let word = self.peektext(aligned)?;
            let word_bytes = word.to_ne_bytes();

            let available = 8 - shift;
            let copy_len = available.min(buf.len() - offset);
            buf[offset..offset + copy_len].copy_from_slice(&word_bytes[shift..shift + copy_len]);
            offset += copy_len;
        }
        Ok(())
    }

    fn write_memory_words(&self, addr: u64, buf: &[u8]) -> Result<(), DebugError> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let word_addr = addr + offset as u64;
            let aligned = word_addr & !7;
            let shift = (word_addr & 7) as usize;
            let available = 8 - shift;
            let copy_len = available.min(buf.len() - offset);

            // Read-modify-write whenever we aren't overwriting the full word,
            // to avoid disturbing neighboring bytes (e.g. another breakpoint
            // in the same 8-byte-aligned word).
            let mut word_bytes = if copy_len < 8 {
                self.peektext(aligned)?.to_ne_bytes()
            } else {
                [0u8; 8]
            };
            word_bytes[shift..shift + copy_len].copy_from_slice(&buf[offset..offset + copy_len]);
            self.poketext(aligned, u64::from_ne_bytes(word_bytes))?;

            offset += copy_len;
        }
        Ok(())
    }

    /// Block until the target stops, transparently handling the signals
    /// that never represent a user-visible event.
    fn wait_classified(&mut self) -> Result<WaitEvent, DebugError> {
        loop {
            let mut status: i32 = 0;
            let result = unsafe { libc::waitpid(self.pid as i32, &mut status, 0) };
            if result == -1 {
                return Err(DebugError::from_errno());
            }

            if libc::WIFEXITED(status) {
                return Ok(WaitEvent::Exited(libc::WEXITSTATUS(status)));
            }
            if libc::WIFSIGNALED(status) {
                return Ok(WaitEvent::Signaled(libc::WTERMSIG(status)));
            }
            if !libc::WIFSTOPPED(status) {
                return Err(DebugError::Internal("unexpected waitpid status".into()));
            }

            self.registers_dirty = true;
            let sig = libc::WSTOPSIG(status);

            match sig {
                libc::SIGTRAP if self.last_step == StepMode::Continue => {
                    return Ok(WaitEvent::BreakpointHit);
                }
                libc::SIGTRAP => {
                    // A single-step completed; nothing further to classify.
                    return Ok(WaitEvent::Signal(libc::SIGTRAP));
                }
                libc::SIGTTIN | libc::SIGTTOU => {
                    self.transfer_terminal_ownership();
                    self.resume_last_mode(libc::SIGCONT)?;
                }
                libc::SIGCHLD => {
                    self.resume_last_mode(0)?;
                }
                libc::SIGINT | libc::SIGSTOP => {
                    self.pending_signal = 0;
                    return Ok(WaitEvent::Signal(sig));
                }
                other => {
                    self.pending_signal = other;
                    return Ok(WaitEvent::Signal(other));
                }
            }
        }
    }

    fn transfer_terminal_ownership(&self) {
        unsafe {
            let pgid = libc::getpgid(self.pid as i32);
            if pgid > 0 {
                libc::tcsetpgrp(libc::STDIN_FILENO, pgid);
            }
        }
    }

    fn resume_last_mode(&self, signal: i32) -> Result<(), DebugError> {
        let request = match self.last_step {
            StepMode::Step => libc::PTRACE_SINGLESTEP,
            StepMode::Continue => libc::PTRACE_CONT,
        };
        ptrace_unit(request, self.pid, 0, signal as u64)?;
        Ok(())
    }

    fn resume(&mut self, mode: StepMode) -> Result<WaitEvent, DebugError> {
        let signal = self.pending_signal;
        self.pending_signal = 0;
        self.last_step = mode;

        let request = match mode {
            StepMode::Step => libc::PTRACE_SINGLESTEP,
            StepMode::Continue => libc::PTRACE_CONT,
        };
        ptrace_unit(request, self.pid, 0, signal as u64)?;
        self.wait_classified()
    }
}

impl ProcessBackend for LinuxBackend {
    fn attach(pid: u32) -> Result<LinuxBackend, DebugError> {
        ptrace_unit(libc::PTRACE_ATTACH, pid, 0, 0)?;

        let mut backend = LinuxBackend {
            pid,
            registers: unsafe { std::mem::zeroed() },
            registers_dirty: true,
            pending_signal: 0,
            last_step: StepMode::Continue,
            mem_fd: None,
        };
        backend.wait_classified()?;
        backend.mem_fd = LinuxBackend::open_mem_fd(pid);
        Ok(backend)
    }

    fn create(argv: &[String]) -> Result<LinuxBackend, DebugError> {
        if argv.is_empty() {
            return Err(DebugError::InvalidArgument("empty argv".into()));
        }

        let mut cstrings: Vec<std::ffi::CString> = Vec::new();
        let mut args: Vec<*const libc::c_char> = Vec::new();
        for arg in argv {
            let cstring = std::ffi::CString::new(arg.clone())
                .map_err(|_| DebugError::InvalidArgument("argv contains NUL".into()))?;
            args.push(cstring.as_ptr());
            cstrings.push(cstring);
        }
        args.push(ptr::null());

        let pid = unsafe {
            let pid = libc::fork();
            if pid == 0 {
                libc::ptrace(libc::PTRACE_TRACEME, 0, ptr::null_mut::<libc::c_void>(), ptr::null_mut::<libc::c_void>());
                libc::execvp(args[0], args.as_ptr());
                libc::_exit(1);
            }
            pid
        };
        if pid < 0 {
            return Err(DebugError::from_errno());
        }

        let mut backend = LinuxBackend {
            pid: pid as u32,
            registers: unsafe { std::mem::zeroed() },
            registers_dirty: true,
            pending_signal: 0,
            last_step: StepMode::Continue,
            mem_fd: None,
        };
        backend.wait_classified()?;
        backend.mem_fd = LinuxBackend::open_mem_fd(pid as u32);
        Ok(backend)
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
        if let Some(fd) = &mut self.mem_fd {
            if fd.seek(SeekFrom::Start(addr)).is_ok() {
                let mut total = 0;
                while total < buf.len() {
                    match fd.read(&mut buf[total..]) {
                        Ok(0) => break,
                        Ok(n) => total += n,
                        Err(_) => break,
                    }
                }
                // Short reads pad with zeros.
                for byte in &mut buf[total..] {
                    *byte = 0;
                }
                return Ok(());
            }
        }
        self.read_memory_words(addr, buf)
    }

    fn write_memory(&mut self, addr: u64, buf: &[u8]) -> Result<(), DebugError> {
        if let Some(fd) = &mut self.mem_fd {
            if fd.seek(SeekFrom::Start(addr)).is_ok() && fd.write_all(buf).is_ok() {
                return Ok(());
            }
        }
        self.write_memory_words(addr, buf)
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
        self.resume(StepMode::Step)
    }

    fn go(&mut self) -> Result<WaitEvent, DebugError> {
        self.resume(StepMode::Continue)
    }

    fn interrupt(&mut self) -> Result<(), DebugError> {
        unsafe {
            if libc::kill(self.pid as i32, libc::SIGSTOP) == -1 {
                return Err(DebugError::from_errno());
            }
        }
        self.wait_classified()?;
        Ok(())
    }

    fn detach(&mut self) -> Result<(), DebugError> {
        ptrace_unit(libc::PTRACE_DETACH, self.pid, 0, 0)?;
        Ok(())
    }

    fn quit(&mut self) -> Result<(), DebugError> {
        unsafe {
            if libc::kill(self.pid as i32, libc::SIGKILL) == -1 {
                return Err(DebugError::from_errno());
            }
        }
        Ok(())
    }

    fn block_size(&self) -> usize {
        if self.mem_fd.is_some() {
            256
        } else {
            std::mem::size_of::<u64>()
        }
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn probe_modules(&self) -> Result<Vec<(u64, Option<String>)>, DebugError> {
        let map = ProcessMap::new(self.pid)
            .map_err(|err| DebugError::Internal(err.to_string()))?;
        Ok(map
            .entries
            .iter()
            .filter(|entry| entry.offset == 0 && entry.executable && entry.filename.is_some())
            .map(|entry| {
                let path = entry.filename.clone().filter(|name| name != "-unknown-");
                (entry.begin, path)
            })
            .collect())
    }
}

/// Map a catalog register to its field in `libc::user_regs_struct` (Linux
/// x86_64 layout).
fn register_field(regs: &libc::user_regs_struct, register: Register) -> u64 {
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
        Register::Flags => regs.eflags,
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

fn set_register_field(regs: &mut libc::user_regs_struct, register: Register, value: u64) {
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
        Register::Flags => regs.eflags = value,
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
