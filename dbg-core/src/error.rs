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

/// Errors produced by every fallible operation in the debugger core.
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    /// Out-of-range register index, negative size, out-of-range breakpoint
    /// index, or otherwise malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A proposed breakpoint's byte range overlaps an existing one.
    #[error("breakpoint at {vaddr:#x} overlaps an existing breakpoint")]
    Overlap { vaddr: u64 },

    /// Allocation failure. Structural only; the core never retries.
    #[error("out of memory")]
    OutOfMemory,

    /// A kernel call failed. The native error code is preserved.
    #[error("{message} (os error {code})")]
    OsError { code: i32, message: String },

    /// An operation requiring a live target was issued while detached.
    #[error("not attached to a process")]
    NotAttached,

    /// An instruction could not be decoded by the instruction decoder.
    #[error("failed to decode instruction: {0}")]
    Decode(String),

    /// An invariant was violated. Fatal in debug builds; surfaced here in
    /// release builds so the embedder can decide how to react.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DebugError {
    /// Build an `OsError` from the current value of `errno`, mirroring
    /// POSIX `strerror` semantics but attached to a typed variant instead
    /// of a boxed trait object.
    pub fn from_errno() -> DebugError {
        let code = unsafe { *libc::__errno_location() };
        DebugError::OsError {
            code,
            message: errno_message(code),
        }
    }

    pub fn os_error(code: i32) -> DebugError {
        DebugError::OsError {
            code,
            message: errno_message(code),
        }
    }
}

fn errno_message(code: i32) -> String {
    unsafe {
        std::ffi::CStr::from_ptr(libc::strerror(code))
            .to_string_lossy()
            .into_owned()
    }
}

/// A Mach kernel return code, reported the same way on Darwin.
#[cfg(target_os = "macos")]
pub fn mach_error(code: i32, context: &str) -> DebugError {
    DebugError::OsError {
        code,
        message: format!("{context}: mach error {code:#x}"),
    }
}
