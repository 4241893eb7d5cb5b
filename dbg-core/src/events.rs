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

use crate::error::DebugError;

/// Callback surface an embedder implements to observe debugging events.
/// `Debugger::go`/`step` invoke these synchronously; there is no internal
/// scheduler, so a callback is free to call back into the `Debugger` itself,
/// and the call that triggered it won't return until it does.
///
/// Every method returns a `Result` so a callback can abort the wait in
/// progress by reporting its own failure; that error propagates straight
/// out of the `Debugger` method that was dispatching the event. Every
/// method also has a no-op default so an embedder only overrides what it
/// cares about.
pub trait EventSink {
    /// A user-visible error or diagnostic message, surfaced the way a shell
    /// would print it, without otherwise affecting the target's state.
    fn on_message(&mut self, _message: &str) -> Result<(), DebugError> {
        Ok(())
    }

    /// The target exited, with its exit status if it terminated normally.
    fn on_process_exited(&mut self, _status: Option<i32>) -> Result<(), DebugError> {
        Ok(())
    }

    /// The target stopped due to a signal with no breakpoint/step meaning.
    fn on_signal(&mut self, _signal: i32) -> Result<(), DebugError> {
        Ok(())
    }

    /// A module (executable mapping) was discovered, at attach/create time
    /// or via a later probe.
    fn on_module_probed(&mut self, _base_addr: u64, _path: Option<&str>) -> Result<(), DebugError> {
        Ok(())
    }
}
