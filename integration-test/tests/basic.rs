use dbg_core::{DebugError, Debugger, NativeBackend};
use integration_test::{compile_source, symbol_address, RecordingSink};
use std::error::Error;

// Set a breakpoint, hit it, then delete it.
#[test]
fn test_set_hit_delete_breakpoint() -> Result<(), Box<dyn Error>> {
    let binary_path = compile_source("target.c")?;
    let target_addr = symbol_address(&binary_path, "target")?;

    let mut sink = RecordingSink::default();
    let mut dbg: Debugger<NativeBackend> = Debugger::create(&[binary_path.clone()], &mut sink)?;

    let index = dbg.set_breakpoint(target_addr)?;
    assert_eq!(dbg.breakpoint_count(), 1);

    dbg.go(&mut sink)?;

    // A breakpoint hit is reported by where execution stopped, not through
    // the message sink.
    assert_eq!(dbg.pc()?, target_addr);
    assert_eq!(dbg.current_breakpoint_index()?, Some(index));

    dbg.delete_breakpoint(index)?;
    assert_eq!(dbg.breakpoint_count(), 0);

    // With the breakpoint gone the target should just run to completion.
    dbg.go(&mut sink)?;
    assert_eq!(sink.exited.len(), 1);

    std::fs::remove_file(&binary_path)?;
    Ok(())
}

// A breakpoint at an address already covered by another is rejected, and
// the rejected insert leaves no trace in the table.
#[test]
fn test_overlap_rejected() -> Result<(), Box<dyn Error>> {
    let binary_path = compile_source("target.c")?;
    let target_addr = symbol_address(&binary_path, "target")?;

    let mut sink = RecordingSink::default();
    let mut dbg: Debugger<NativeBackend> = Debugger::create(&[binary_path.clone()], &mut sink)?;

    dbg.set_breakpoint(target_addr)?;
    let err = dbg.set_breakpoint(target_addr).unwrap_err();
    assert!(matches!(err, DebugError::Overlap { vaddr } if vaddr == target_addr));
    // A failed insert must not have left a stray entry behind.
    assert_eq!(dbg.breakpoint_count(), 1);

    dbg.quit()?;
    std::fs::remove_file(&binary_path)?;
    Ok(())
}

// Stepping over an installed breakpoint temporarily unpatches, steps, and
// re-patches, leaving the PC past the breakpoint's instruction, and never
// reports the step itself as an asynchronous signal.
#[test]
fn test_step_over_breakpoint() -> Result<(), Box<dyn Error>> {
    let binary_path = compile_source("target.c")?;
    let target_addr = symbol_address(&binary_path, "target")?;

    let mut sink = RecordingSink::default();
    let mut dbg: Debugger<NativeBackend> = Debugger::create(&[binary_path.clone()], &mut sink)?;

    let index = dbg.set_breakpoint(target_addr)?;
    dbg.go(&mut sink)?;
    assert_eq!(dbg.current_breakpoint_index()?, Some(index));

    dbg.step()?;
    let pc_after = dbg.pc()?;
    assert_ne!(pc_after, target_addr);
    assert_eq!(dbg.current_breakpoint_index()?, None);
    assert!(sink.signals.is_empty());

    dbg.delete_breakpoint(index)?;
    dbg.quit()?;
    std::fs::remove_file(&binary_path)?;
    Ok(())
}

// A write spanning an installed breakpoint leaves the trapping opcode
// resident in target memory while the logical view reflects the write.
#[test]
fn test_write_memory_spanning_breakpoint() -> Result<(), Box<dyn Error>> {
    let binary_path = compile_source("target.c")?;
    let target_addr = symbol_address(&binary_path, "target")?;

    let mut sink = RecordingSink::default();
    let mut dbg: Debugger<NativeBackend> = Debugger::create(&[binary_path.clone()], &mut sink)?;

    let index = dbg.set_breakpoint(target_addr)?;
    let original_byte = dbg.list_breakpoints().next().unwrap().original[0];

    // Write a range that starts one byte before the patch and ends one
    // byte after it, so the write genuinely spans the breakpoint rather
    // than just touching its first byte.
    let write = [0x11, 0x22, 0x33];
    dbg.write_memory(target_addr - 1, &write)?;

    // The logical view reports exactly what was written...
    let mut logical_after = [0u8; 3];
    dbg.read_memory(target_addr - 1, &mut logical_after)?;
    assert_eq!(logical_after, write);

    // ...while the breakpoint's saved original (not target memory) absorbed
    // the byte that fell inside the patch, leaving the trap itself intact.
    assert_eq!(dbg.list_breakpoints().next().unwrap().original[0], write[1]);
    assert_ne!(dbg.list_breakpoints().next().unwrap().original[0], original_byte);

    dbg.delete_breakpoint(index)?;
    dbg.quit()?;
    std::fs::remove_file(&binary_path)?;
    Ok(())
}

// Reading/writing a register round-trips the written value.
#[test]
fn test_register_round_trip() -> Result<(), Box<dyn Error>> {
    let binary_path = compile_source("target.c")?;

    let mut sink = RecordingSink::default();
    let mut dbg: Debugger<NativeBackend> = Debugger::create(&[binary_path.clone()], &mut sink)?;

    dbg.set_register(dbg_core::Register::Ax, 0x1122334455667788)?;
    assert_eq!(dbg.get_register(dbg_core::Register::Ax)?, 0x1122334455667788);

    dbg.quit()?;
    std::fs::remove_file(&binary_path)?;
    Ok(())
}
