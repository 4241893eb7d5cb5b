use clap::Parser;
use dbg_core::{DebugError, Debugger, EventSink, NativeBackend};
use tracing::{error, info};

/// Minimal smoke-test binary for `dbg-core`. Not an interactive shell: it
/// attaches to (or launches) one target, reports any breakpoint it's told
/// to set, resumes once, and detaches.
#[derive(Parser)]
#[command(name = "dbg-cli", about = "Attach to or launch a target and run one scripted session")]
struct Args {
    /// Attach to an already-running process by PID.
    #[arg(long, conflicts_with = "command")]
    pid: Option<u32>,

    /// Set a software breakpoint at this address (hex, e.g. 0x401020)
    /// before resuming.
    #[arg(long, value_parser = parse_hex_addr)]
    breakpoint: Option<u64>,

    /// Launch this command instead of attaching by PID.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn parse_hex_addr(s: &str) -> Result<u64, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
}

struct LoggingSink;

impl EventSink for LoggingSink {
    fn on_message(&mut self, message: &str) -> Result<(), DebugError> {
        info!(message, "message");
        Ok(())
    }

    fn on_process_exited(&mut self, status: Option<i32>) -> Result<(), DebugError> {
        match status {
            Some(code) => info!(code, "process exited"),
            None => info!("process terminated by signal"),
        }
        Ok(())
    }

    fn on_signal(&mut self, signal: i32) -> Result<(), DebugError> {
        info!(signal, "stopped by signal");
        Ok(())
    }

    fn on_module_probed(&mut self, base_addr: u64, path: Option<&str>) -> Result<(), DebugError> {
        info!(base_addr = format!("{base_addr:#x}"), path, "module probed");
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        error!(%err, "session failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), DebugError> {
    let mut sink = LoggingSink;

    let mut dbg: Debugger<NativeBackend> = match (args.pid, args.command.is_empty()) {
        (Some(pid), _) => Debugger::attach(pid, &mut sink)?,
        (None, false) => Debugger::create(&args.command, &mut sink)?,
        (None, true) => {
            return Err(DebugError::InvalidArgument(
                "either --pid <n> or a trailing command is required".into(),
            ))
        }
    };

    if let Some(addr) = args.breakpoint {
        let index = dbg.set_breakpoint(addr)?;
        info!(addr = format!("{addr:#x}"), index, "breakpoint set");
    }

    dbg.go(&mut sink)?;

    if dbg.is_attached() {
        if let Some(index) = dbg.current_breakpoint_index()? {
            info!(index, pc = format!("{:#x}", dbg.pc()?), "stopped at breakpoint");
        }

        // The target may have already exited during `go`; detaching from a
        // gone process is a harmless no-op failure here, not a session
        // error, so it's reported through the same channel an embedder
        // uses for any other user-visible message.
        if let Err(err) = dbg.detach() {
            sink.on_message(&err.to_string())?;
        }
    }

    Ok(())
}
