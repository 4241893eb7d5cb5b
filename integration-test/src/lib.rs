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

use dbg_core::{DebugError, EventSink};
use std::error::Error;
use std::process;

/// Compile a single tracee source file, using the appropriate compiler
/// based on the file extension. Returns the path of the resulting binary.
/// C binaries are linked without PIE so a symbol's link-time address (as
/// reported by `nm`) matches its runtime address, letting tests pick a
/// breakpoint target deterministically without a symbol resolver in the
/// debugger core itself.
pub fn compile_source(filename: &str) -> Result<String, Box<dyn Error>> {
    let source_path = format!("{}/{}", std::env::var("TEST_TRACEE_PATH")?, filename);

    let period_offset = filename
        .find('.')
        .ok_or("no extension in source filename")?;
    let basename = &filename[..period_offset];
    let extension = &filename[period_offset..];

    let binary_path = format!("/tmp/{}-{}", basename, process::id());

    let mut command = match extension {
        ".c" => {
            let mut command = process::Command::new(std::env::var("CC")?);
            command.args([&source_path, "-no-pie", "-o", &binary_path]);
            command
        }
        ".cc" => {
            let mut command = process::Command::new(std::env::var("CXX")?);
            command.args([&source_path, "-no-pie", "-o", &binary_path]);
            command
        }
        ".rs" => {
            let mut command = process::Command::new(std::env::var("RUSTC")?);
            command.args(["-C", "relocation-model=static", &source_path, "-o", &binary_path]);
            command
        }
        _ => panic!("Unknown extension: {}", extension),
    };

    let compiler_status = command.spawn()?.wait()?;
    assert_eq!(compiler_status.code(), Some(0));

    Ok(binary_path)
}

/// Resolve a symbol's address in a compiled binary by shelling out to
/// `nm`. This is a test-harness convenience, not a capability of
/// `dbg-core` itself — the debugger core takes raw addresses only
/// (symbolication is explicitly out of scope for it).
pub fn symbol_address(binary_path: &str, symbol: &str) -> Result<u64, Box<dyn Error>> {
    let output = process::Command::new("nm").arg(binary_path).output()?;
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout)?;

    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let addr_field = fields.next().ok_or("missing address field")?;
        let _kind = fields.next();
        let name = fields.next().unwrap_or("");

        if name == symbol {
            return Ok(u64::from_str_radix(addr_field, 16)?);
        }
    }

    Err(format!("symbol {symbol} not found in {binary_path}").into())
}

/// An `EventSink` that records every callback invocation for test
/// assertions instead of acting on them.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Vec<String>,
    pub exited: Vec<Option<i32>>,
    pub signals: Vec<i32>,
    pub modules: Vec<(u64, Option<String>)>,
}

impl EventSink for RecordingSink {
    fn on_message(&mut self, message: &str) -> Result<(), DebugError> {
        self.messages.push(message.to_string());
        Ok(())
    }

    fn on_process_exited(&mut self, status: Option<i32>) -> Result<(), DebugError> {
        self.exited.push(status);
        Ok(())
    }

    fn on_signal(&mut self, signal: i32) -> Result<(), DebugError> {
        self.signals.push(signal);
        Ok(())
    }

    fn on_module_probed(&mut self, base_addr: u64, path: Option<&str>) -> Result<(), DebugError> {
        self.modules.push((base_addr, path.map(str::to_string)));
        Ok(())
    }
}
