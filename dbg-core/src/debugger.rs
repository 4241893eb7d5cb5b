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
use crate::breakpoint::BreakpointTable;
use crate::cpu::{Cpu, DecodedInstruction, MemoryView, StackFrame};
use crate::error::DebugError;
use crate::events::EventSink;
use crate::register::Register;
use tracing::{debug, info, instrument};

const MAX_X86_INSTRUCTION_LEN: usize = 16;

/// Owns a `ProcessBackend`, a `Cpu`, and a `BreakpointTable`, and presents
/// memory and execution as if no breakpoint patches existed. This is the
/// component an embedder actually talks to.
pub struct Debugger<B: ProcessBackend> {
    backend: B,
    cpu: Cpu,
    breakpoints: BreakpointTable,
    attached: bool,
}

/// Borrows just the backend and breakpoint table so `Cpu`'s memory-reading
/// operations (disassembly, stack unwinding) see the logical view without
/// needing a borrow of the whole `Debugger`.
struct LogicalMemory<'backend, B: ProcessBackend> {
    backend: &'backend mut B,
    breakpoints: &'backend BreakpointTable,
}

impl<'backend, B: ProcessBackend> MemoryView for LogicalMemory<'backend, B> {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
        logical_read(self.backend, self.breakpoints, addr, buf)
    }
}

fn logical_read<B: ProcessBackend>(
    backend: &mut B,
    breakpoints: &BreakpointTable,
    addr: u64,
    buf: &mut [u8],
) -> Result<(), DebugError> {
    backend.read_memory(addr, buf)?;

    let len = buf.len();
    for bp in breakpoints.find_range(addr, len) {
        let overlap_start = addr.max(bp.vaddr);
        let overlap_end = (addr + len as u64).min(bp.vaddr + bp.size() as u64);

        let dst_start = (overlap_start - addr) as usize;
        let dst_end = (overlap_end - addr) as usize;
        let src_start = (overlap_start - bp.vaddr) as usize;
        let src_end = (overlap_end - bp.vaddr) as usize;

        buf[dst_start..dst_end].copy_from_slice(&bp.original[src_start..src_end]);
    }
    Ok(())
}

impl<B: ProcessBackend> Debugger<B> {
    /// Bitness is fixed at 64 for now; all backends target x86-64.
    fn new(backend: B) -> Debugger<B> {
        Debugger {
            backend,
            cpu: Cpu::new(64),
            breakpoints: BreakpointTable::new(),
            attached: true,
        }
    }

    /// Whether this facade still considers itself bound to a live target.
    /// Goes false once `detach`/`quit` succeed or the target exits; every
    /// other operation remains defined only while this is true.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    fn require_attached(&self) -> Result<(), DebugError> {
        if self.attached {
            Ok(())
        } else {
            Err(DebugError::NotAttached)
        }
    }

    #[instrument(skip(sink))]
    pub fn attach(pid: u32, sink: &mut dyn EventSink) -> Result<Debugger<B>, DebugError> {
        let backend = B::attach(pid)?;
        info!(pid, "attached");
        let mut dbg = Debugger::new(backend);
        dbg.probe_and_report_modules(sink)?;
        Ok(dbg)
    }

    #[instrument(skip(sink))]
    pub fn create(argv: &[String], sink: &mut dyn EventSink) -> Result<Debugger<B>, DebugError> {
        let backend = B::create(argv)?;
        info!(?argv, "created");
        let mut dbg = Debugger::new(backend);
        dbg.probe_and_report_modules(sink)?;
        Ok(dbg)
    }

    fn probe_and_report_modules(&mut self, sink: &mut dyn EventSink) -> Result<(), DebugError> {
        for (base_addr, path) in self.backend.probe_modules()? {
            sink.on_module_probed(base_addr, path.as_deref())?;
        }
        Ok(())
    }

    /// Logical memory read: raw-read the range, then paper over any
    /// installed breakpoints with their original bytes.
    pub fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
        self.require_attached()?;
        logical_read(&mut self.backend, &self.breakpoints, addr, buf)
    }

    /// Logical memory write: bytes landing inside an installed breakpoint
    /// are recorded into `bp.original` rather than written through (the
    /// trapping opcode stays resident); everything else is raw-written.
    pub fn write_memory(&mut self, addr: u64, buf: &[u8]) -> Result<(), DebugError> {
        self.require_attached()?;
        let len = buf.len();
        let overlapping: Vec<(u64, usize)> = self
            .breakpoints
            .find_range(addr, len)
            .iter()
            .map(|bp| (bp.vaddr, bp.size()))
            .collect();

        let mut cursor = addr;
        for (bp_vaddr, bp_size) in overlapping {
            let bp_end = bp_vaddr + bp_size as u64;

            if cursor < bp_vaddr {
                let flush_len = (bp_vaddr - cursor) as usize;
                let src_start = (cursor - addr) as usize;
                self.backend
                    .write_memory(cursor, &buf[src_start..src_start + flush_len])?;
            }

            let overlap_start = cursor.max(bp_vaddr);
            let overlap_end = (addr + len as u64).min(bp_end);
            if overlap_start < overlap_end {
                let src_start = (overlap_start - addr) as usize;
                let src_end = (overlap_end - addr) as usize;
                let index = self
                    .breakpoints
                    .lookup_index(bp_vaddr)
                    .ok_or_else(|| DebugError::Internal("breakpoint vanished mid-write".into()))?;
                let dst_start = (overlap_start - bp_vaddr) as usize;
                let dst_end = (overlap_end - bp_vaddr) as usize;
                let bp = self.breakpoints_mut_entry(index)?;
                bp.original[dst_start..dst_end].copy_from_slice(&buf[src_start..src_end]);
            }

            cursor = cursor.max(bp_end);
        }

        if cursor < addr + len as u64 {
            let src_start = (cursor - addr) as usize;
            self.backend.write_memory(cursor, &buf[src_start..])?;
        }

        Ok(())
    }

    fn breakpoints_mut_entry(
        &mut self,
        index: usize,
    ) -> Result<&mut crate::breakpoint::Breakpoint, DebugError> {
        self.breakpoints.get_mut(index).ok_or_else(|| {
            DebugError::InvalidArgument(format!("breakpoint index {index} out of range"))
        })
    }

    /// Current program counter.
    pub fn pc(&mut self) -> Result<u64, DebugError> {
        self.require_attached()?;
        self.backend.get_register(Register::Ip)
    }

    pub fn get_register(&mut self, register: Register) -> Result<u64, DebugError> {
        self.require_attached()?;
        self.backend.get_register(register)
    }

    pub fn set_register(&mut self, register: Register, value: u64) -> Result<(), DebugError> {
        self.require_attached()?;
        self.backend.set_register(register, value)
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    /// All installed breakpoints, in insertion order (the numbered handles a
    /// shell-like embedder would present to a user).
    pub fn list_breakpoints(&self) -> impl Iterator<Item = &crate::breakpoint::Breakpoint> {
        self.breakpoints.iter()
    }

    pub fn current_breakpoint_index(&mut self) -> Result<Option<usize>, DebugError> {
        let pc = self.pc()?;
        Ok(self.breakpoints.lookup_index(pc))
    }

    /// Install a software breakpoint at `pc`.
    #[instrument(skip(self))]
    pub fn set_breakpoint(&mut self, pc: u64) -> Result<usize, DebugError> {
        self.require_attached()?;
        let size = match self.cpu.fixed_breakpoint_size() {
            Some(n) => n,
            None => {
                let mut probe = [0u8; MAX_X86_INSTRUCTION_LEN];
                self.read_memory(pc, &mut probe)?;
                let len = self.cpu.instruction_length(&probe);
                if len == 0 {
                    return Err(DebugError::Decode(format!(
                        "could not determine instruction length at {pc:#x}"
                    )));
                }
                len
            }
        };

        self.breakpoints.insert(pc, size)?;
        let index = self.breakpoints.len() - 1;

        let result: Result<(), DebugError> = (|| {
            let mut original = vec![0u8; size];
            self.read_memory(pc, &mut original)?;

            let mut patched = original.clone();
            self.cpu.generate_breakpoint(&mut patched);

            let bp = self
                .breakpoints
                .get_mut(index)
                .ok_or_else(|| DebugError::Internal("just-inserted breakpoint missing".into()))?;
            bp.original = original;
            bp.patched = patched.clone();

            self.backend.write_memory(pc, &patched)
        })();

        if let Err(err) = result {
            // Roll back: the new entry is always the last index, since
            // nothing else can grow the table between insert and here in
            // the single-threaded model.
            let _ = self.breakpoints.remove(index);
            return Err(err);
        }

        debug!(pc, size, "breakpoint set");
        Ok(index)
    }

    /// Remove a previously installed breakpoint.
    #[instrument(skip(self))]
    pub fn delete_breakpoint(&mut self, index: usize) -> Result<(), DebugError> {
        self.require_attached()?;
        let bp = self
            .breakpoints
            .get(index)
            .ok_or_else(|| DebugError::InvalidArgument(format!("breakpoint index {index} out of range")))?;
        let vaddr = bp.vaddr;
        let original = bp.original.clone();

        self.backend.write_memory(vaddr, &original)?;
        self.breakpoints.remove(index)?;
        debug!(vaddr, "breakpoint deleted");
        Ok(())
    }

    /// Single-step exactly one instruction, transparently stepping over an
    /// installed breakpoint at the current PC: unpatch it, issue the
    /// backend step, then repatch. A step is not itself a dispatchable
    /// event, so this never touches an event sink.
    #[instrument(skip(self))]
    pub fn step(&mut self) -> Result<(), DebugError> {
        self.require_attached()?;
        self.step_raw()?;
        Ok(())
    }

    /// The four-step unpatch/step/repatch sequence shared by `step` and by
    /// `go`'s own bookkeeping when it needs to move off a breakpoint before
    /// resuming. Returns the backend's raw event so a caller that cares
    /// (only `go` does) can still react to the target exiting mid-step.
    fn step_raw(&mut self) -> Result<WaitEvent, DebugError> {
        let pc = self.pc()?;
        let bp_index = self.breakpoints.lookup_index(pc);

        if let Some(index) = bp_index {
            let bp = self.breakpoints.get(index).unwrap();
            self.backend.write_memory(bp.vaddr, &bp.original.clone())?;
        }

        let event = self.backend.step()?;

        if let Some(index) = bp_index {
            let bp = self.breakpoints.get(index).unwrap();
            self.backend.write_memory(bp.vaddr, &bp.patched.clone())?;
        }

        Ok(event)
    }

    /// Resume execution until the next event.
    #[instrument(skip(self, sink))]
    pub fn go(&mut self, sink: &mut dyn EventSink) -> Result<(), DebugError> {
        self.require_attached()?;
        let pc = self.pc()?;
        if self.breakpoints.lookup_index(pc).is_some() {
            let event = self.step_raw()?;
            if matches!(event, WaitEvent::Exited(_) | WaitEvent::Signaled(_)) {
                return self.dispatch(event, sink);
            }

            // If still on a (necessarily different, adjacent) breakpoint
            // after stepping off the first one, the caller sees that hit
            // immediately rather than running further.
            let pc_after = self.pc()?;
            if self.breakpoints.lookup_index(pc_after).is_some() {
                return Ok(());
            }
        }

        let event = self.backend.go()?;
        self.dispatch(event, sink)
    }

    fn dispatch(&mut self, event: WaitEvent, sink: &mut dyn EventSink) -> Result<(), DebugError> {
        match event {
            WaitEvent::Exited(status) => {
                info!(status, "process exited");
                self.attached = false;
                sink.on_process_exited(Some(status))?;
            }
            WaitEvent::Signaled(signal) => {
                info!(signal, "process terminated by signal");
                self.attached = false;
                sink.on_process_exited(None)?;
            }
            WaitEvent::BreakpointHit => {
                let reported_pc = self.pc()?;
                let pc = self.cpu.on_breakpoint_hit(reported_pc);
                self.backend.set_register(Register::Ip, pc)?;
                debug!(pc, "breakpoint hit");
            }
            WaitEvent::Signal(signal) => {
                debug!(signal, "stopped by signal");
                sink.on_signal(signal)?;
            }
            WaitEvent::ModuleProbed { base_addr, path } => {
                sink.on_module_probed(base_addr, path.as_deref())?;
            }
        }
        Ok(())
    }

    /// Asynchronously stop the target (e.g. from a SIGINT handler).
    pub fn interrupt(&mut self) -> Result<(), DebugError> {
        self.require_attached()?;
        self.backend.interrupt()
    }

    /// Remove every installed breakpoint's patch from target memory, then
    /// let the backend restore its exception/ptrace state and release the
    /// target. The breakpoint table itself is left intact; the embedder
    /// may inspect it or drop the `Debugger` to clear it.
    #[instrument(skip(self))]
    pub fn detach(&mut self) -> Result<(), DebugError> {
        self.require_attached()?;
        for bp in self.breakpoints.iter() {
            self.backend.write_memory(bp.vaddr, &bp.original)?;
        }
        self.backend.detach()?;
        self.attached = false;
        info!("detached");
        Ok(())
    }

    pub fn quit(&mut self) -> Result<(), DebugError> {
        self.require_attached()?;
        self.backend.quit()?;
        self.attached = false;
        Ok(())
    }

    /// Decode up to `instrs` instructions starting at `addr` through the
    /// logical memory view. `None` decodes until memory can no longer be
    /// read.
    pub fn disassemble(
        &mut self,
        addr: u64,
        instrs: Option<usize>,
        callback: impl FnMut(DecodedInstruction),
    ) -> Result<(), DebugError> {
        self.require_attached()?;
        let cpu = &self.cpu;
        let mut view = LogicalMemory {
            backend: &mut self.backend,
            breakpoints: &self.breakpoints,
        };
        cpu.disassemble(&mut view, addr, instrs, callback)
    }

    /// Walk the call stack from the current PC/frame-pointer/stack-pointer.
    /// The callback returns `false` to cancel early.
    pub fn stack_trace(
        &mut self,
        callback: impl FnMut(StackFrame) -> bool,
    ) -> Result<(), DebugError> {
        let pc = self.pc()?;
        let frame = self.backend.get_register(Register::Bp)?;
        let stack = self.backend.get_register(Register::Sp)?;

        let cpu = &self.cpu;
        let mut view = LogicalMemory {
            backend: &mut self.backend,
            breakpoints: &self.breakpoints,
        };
        cpu.stack_trace(&mut view, pc, frame, stack, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A `ProcessBackend` backed by a sparse byte map instead of a real
    /// process, so memory-layer invariants can be checked without ptrace.
    struct FakeBackend {
        memory: HashMap<u64, u8>,
    }

    impl FakeBackend {
        fn new() -> FakeBackend {
            FakeBackend {
                memory: HashMap::new(),
            }
        }

        fn raw_byte(&self, addr: u64) -> u8 {
            *self.memory.get(&addr).unwrap_or(&0)
        }
    }

    impl ProcessBackend for FakeBackend {
        fn attach(_pid: u32) -> Result<FakeBackend, DebugError> {
            Ok(FakeBackend::new())
        }

        fn create(_argv: &[String]) -> Result<FakeBackend, DebugError> {
            Ok(FakeBackend::new())
        }

        fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = self.raw_byte(addr + i as u64);
            }
            Ok(())
        }

        fn write_memory(&mut self, addr: u64, buf: &[u8]) -> Result<(), DebugError> {
            for (i, &byte) in buf.iter().enumerate() {
                self.memory.insert(addr + i as u64, byte);
            }
            Ok(())
        }

        fn get_register(&mut self, _register: Register) -> Result<u64, DebugError> {
            Ok(0)
        }

        fn set_register(&mut self, _register: Register, _value: u64) -> Result<(), DebugError> {
            Ok(())
        }

        fn step(&mut self) -> Result<WaitEvent, DebugError> {
            Ok(WaitEvent::Signal(0))
        }

        fn go(&mut self) -> Result<WaitEvent, DebugError> {
            Ok(WaitEvent::Signal(0))
        }

        fn interrupt(&mut self) -> Result<(), DebugError> {
            Ok(())
        }

        fn detach(&mut self) -> Result<(), DebugError> {
            Ok(())
        }

        fn quit(&mut self) -> Result<(), DebugError> {
            Ok(())
        }

        fn pid(&self) -> u32 {
            0
        }
    }

    fn debugger_with(memory: &[(u64, u8)]) -> Debugger<FakeBackend> {
        let mut backend = FakeBackend::new();
        for &(addr, byte) in memory {
            backend.memory.insert(addr, byte);
        }
        Debugger::new(backend)
    }

    // A write spanning an installed breakpoint: the byte(s) that fall under
    // the patch go into the breakpoint's saved original instead of target
    // memory, so the trapping opcode stays resident; everything outside the
    // patch is written straight through. The logical view still reports
    // exactly what was written.
    #[test]
    fn write_memory_spanning_breakpoint() {
        let mut dbg = debugger_with(&[(0x3000, 0xAA)]);
        let index = dbg.set_breakpoint(0x3000).unwrap();
        assert_eq!(dbg.backend.raw_byte(0x3000), 0xCC);

        dbg.write_memory(0x2FFF, &[0x11, 0x22, 0x33]).unwrap();

        assert_eq!(dbg.backend.raw_byte(0x2FFF), 0x11);
        assert_eq!(dbg.backend.raw_byte(0x3000), 0xCC);
        assert_eq!(dbg.backend.raw_byte(0x3001), 0x33);
        assert_eq!(dbg.breakpoints.get(index).unwrap().original, vec![0x22]);

        let mut logical = [0u8; 3];
        dbg.read_memory(0x2FFF, &mut logical).unwrap();
        assert_eq!(logical, [0x11, 0x22, 0x33]);
    }

    // With no breakpoint in the way, a write through the logical view lands
    // straight in target memory and reads back unchanged.
    #[test]
    fn write_then_read_round_trips_without_a_breakpoint() {
        let mut dbg = debugger_with(&[]);
        dbg.write_memory(0x1000, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        dbg.read_memory(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
