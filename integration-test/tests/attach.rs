use dbg_core::{DebugError, Debugger, NativeBackend};
use integration_test::{compile_source, RecordingSink};
use std::error::Error;
use std::io::Read;
use std::mem;
use std::process;
use std::sync::atomic::{AtomicPtr, Ordering};

// Read pending output from the stdout of a child process. Used to
// synchronize the state of the child process with the test case: the
// tracee prints a line every iteration of its loop.
fn read_child_output(stdout: &mut impl Read) -> Result<String, Box<dyn Error>> {
    let mut buffer: [u8; 1024] = [0; 1024];
    let n = stdout.read(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer[..n]).to_string())
}

// Live only for the duration of the blocking `go()` call below, on the
// single thread that's also the ptrace tracer. Mirrors the one acceptable
// mutable global a real SIGINT handler would need to reach the debugger
// it's interrupting.
static INTERRUPT_TARGET: AtomicPtr<Debugger<NativeBackend>> =
    AtomicPtr::new(std::ptr::null_mut());

extern "C" fn handle_alarm(_signum: libc::c_int) {
    let ptr = INTERRUPT_TARGET.load(Ordering::SeqCst);
    if !ptr.is_null() {
        let _ = unsafe { (*ptr).interrupt() };
    }
}

// Attach to an already-running process, and have a real signal handler call
// `interrupt()` reentrantly while the controlling thread is blocked inside
// `go`. `interrupt()`'s own wait reaps the real stop; the interrupted outer
// `go` call then surfaces the interruption as an OS error, which is exactly
// how a caller driving this from a signal handler would see it.
#[test]
fn test_attach_interrupt_detach() -> Result<(), Box<dyn Error>> {
    let binary_path = compile_source("forever.c")?;
    let mut forever = process::Command::new(&binary_path)
        .stdout(process::Stdio::piped())
        .spawn()?;
    let forever_pid = forever.id();
    let mut stdout = forever.stdout.take().ok_or("stdout not captured")?;

    // Wait for the tracee to start looping before attaching.
    read_child_output(&mut stdout)?;

    let mut sink = RecordingSink::default();
    let mut dbg: Debugger<NativeBackend> = Debugger::attach(forever_pid, &mut sink)?;

    INTERRUPT_TARGET.store(&mut dbg as *mut Debugger<NativeBackend>, Ordering::SeqCst);

    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handle_alarm as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut());
        libc::alarm(1);
    }

    let go_result = dbg.go(&mut sink);

    unsafe {
        libc::alarm(0);
        libc::signal(libc::SIGALRM, libc::SIG_DFL);
    }
    INTERRUPT_TARGET.store(std::ptr::null_mut(), Ordering::SeqCst);

    // `go`'s own wait was interrupted mid-syscall by the alarm; the real
    // stop already happened inside the handler's `interrupt()` call.
    if let Err(err) = go_result {
        assert!(matches!(err, DebugError::OsError { .. }));
    }

    // The process must be suspended: register I/O is only defined then.
    assert!(dbg.pc().is_ok());

    dbg.detach()?;
    unsafe {
        libc::kill(forever_pid as i32, libc::SIGKILL);
    }
    forever.wait()?;
    std::fs::remove_file(&binary_path)?;

    Ok(())
}
