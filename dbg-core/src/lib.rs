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

//! A cross-platform native debugger core for x86 and x86-64 targets.
//!
//! The crate is organized around five small components: a breakpoint table
//! ([`breakpoint`]), an ISA-aware helper ([`cpu`]), an OS-specific process
//! backend ([`backend`]), a facade tying the three together into a logical
//! (patch-hiding) view of the target ([`debugger`]), and an embedder
//! callback trait ([`events`]).

pub mod backend;
pub mod breakpoint;
pub mod cpu;
pub mod debugger;
pub mod error;
pub mod events;
pub mod process_map;
pub mod register;

pub use backend::{ProcessBackend, WaitEvent};
pub use breakpoint::{Breakpoint, BreakpointTable};
pub use cpu::{Cpu, DecodedInstruction, StackFrame};
pub use debugger::Debugger;
pub use error::DebugError;
pub use events::EventSink;
pub use register::{Register, REGISTER_COUNT};

#[cfg(target_os = "linux")]
pub use backend::linux::LinuxBackend as NativeBackend;

#[cfg(target_os = "macos")]
pub use backend::darwin::DarwinBackend as NativeBackend;
