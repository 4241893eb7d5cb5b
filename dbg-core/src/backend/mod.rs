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

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod darwin;

use crate::error::DebugError;
use crate::register::Register;

/// One event reported by `ProcessBackend::wait`. The Debugger facade
/// classifies and reacts to these; `EventSink` is notified of the subset
/// the embedder cares about.
#[derive(Debug, Clone)]
pub enum WaitEvent {
    /// The target exited normally with the given status code.
    Exited(i32),

    /// The target was terminated by a signal.
    Signaled(i32),

    /// The target stopped at a software breakpoint. The reported PC is
    /// still one byte past the `INT3` that trapped; the caller (the
    /// Debugger facade) applies `Cpu::on_breakpoint_hit` to rewind it.
    BreakpointHit,

    /// The target stopped due to a signal with no special handling
    /// (including `interrupt()`-induced stops).
    Signal(i32),

    /// A new executable mapping with zero file-offset was probed into the
    /// target's address space. `path` is `None` when the OS reports the
    /// mapping's origin as unknown.
    ModuleProbed { base_addr: u64, path: Option<String> },
}

/// Native OS binding for a single traced process. One implementation per OS
/// family; the Debugger facade is generic over this trait, not over a
/// concrete backend.
///
/// All operations except `attach`/`create`/`wait`/`interrupt` are only
/// defined while the target is suspended.
pub trait ProcessBackend {
    /// Attach to an already-running process by PID, stopping it.
    fn attach(pid: u32) -> Result<Self, DebugError>
    where
        Self: Sized;

    /// Spawn `argv` as a new child, starting it suspended at its first
    /// instruction.
    fn create(argv: &[String]) -> Result<Self, DebugError>
    where
        Self: Sized;

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError>;
    fn write_memory(&mut self, addr: u64, buf: &[u8]) -> Result<(), DebugError>;

    fn get_register(&mut self, register: Register) -> Result<u64, DebugError>;
    fn set_register(&mut self, register: Register, value: u64) -> Result<(), DebugError>;

    /// Single-step exactly one instruction on the current thread. Sibling
    /// threads are paused for the duration.
    fn step(&mut self) -> Result<WaitEvent, DebugError>;

    /// Resume until the next event.
    fn go(&mut self) -> Result<WaitEvent, DebugError>;

    /// Asynchronously stop the target. Idempotent.
    fn interrupt(&mut self) -> Result<(), DebugError>;

    /// Restore original exception/ptrace state and let the target run free.
    fn detach(&mut self) -> Result<(), DebugError>;

    /// Terminate the target.
    fn quit(&mut self) -> Result<(), DebugError>;

    /// Recommended bulk I/O granularity.
    fn block_size(&self) -> usize {
        256
    }

    fn pid(&self) -> u32;

    /// Enumerate executable, zero-file-offset mappings in the target's
    /// address space. The default implementation reports none; backends
    /// without a native module-probing mechanism may leave it.
    fn probe_modules(&self) -> Result<Vec<(u64, Option<String>)>, DebugError> {
        Ok(Vec::new())
    }
}
