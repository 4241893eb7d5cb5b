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
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register as IcedRegister};

/// A single decoded instruction handed to a `Disassemble` callback.
pub struct DecodedInstruction {
    pub addr: u64,
    pub bytes: Vec<u8>,
    pub text: String,
}

/// One frame produced while walking the call stack.
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    pub pc: u64,
    pub frame_pointer: u64,
}

/// ISA-specific glue: instruction decoding, breakpoint byte generation, and
/// frame-pointer stack unwinding for x86/x86-64. Holds no OS state;
/// everything it needs comes through a `MemoryView` supplied by the caller,
/// which is the Debugger facade's logical (breakpoint-hiding) memory.
pub struct Cpu {
    bitness: u32,
}

/// Minimal surface `Cpu` needs from the Debugger to read target memory and
/// registers, kept separate from `ProcessBackend` so `Cpu` never depends on
/// an OS-specific type.
pub trait MemoryView {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError>;
}

impl Cpu {
    /// `bitness` is 32 or 64, matching the target process's pointer width.
    pub fn new(bitness: u32) -> Cpu {
        Cpu { bitness }
    }

    /// The length, in bytes, of the instruction at `text` (up to `len` bytes
    /// available). Returns zero if the bytes don't decode.
    pub fn instruction_length(&self, text: &[u8]) -> usize {
        let mut decoder = Decoder::new(self.bitness, text, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return 0;
        }
        let instr = decoder.decode();
        instr.len()
    }

    /// Software breakpoints on x86 are a single `INT3` (0xCC) byte,
    /// independent of the instruction it replaces. `None` would mean an ISA
    /// that requires per-instruction sizing before a bp can be placed; x86
    /// never does.
    pub fn fixed_breakpoint_size(&self) -> Option<usize> {
        Some(1)
    }

    /// Fill `buffer` with the trapping image for a breakpoint of the given
    /// length. For x86, every byte is `INT3`; trailing bytes beyond the
    /// first are never executed because control traps on the first one,
    /// but are kept identical to `original` except for that leading byte
    /// in the common one-byte-breakpoint case.
    pub fn generate_breakpoint(&self, buffer: &mut [u8]) {
        if let Some(first) = buffer.first_mut() {
            *first = 0xCC;
        }
    }

    /// The fixed-up program counter after a software breakpoint trap: the
    /// reported PC is one past the `INT3`, so rewind it to the breakpoint's
    /// own address.
    pub fn on_breakpoint_hit(&self, reported_pc: u64) -> u64 {
        reported_pc.saturating_sub(1)
    }

    /// Stream a decoded instruction listing starting at `addr`, invoking
    /// `callback` for each one. `instrs` bounds how many are produced;
    /// `None` disassembles until memory can no longer be read.
    pub fn disassemble<M: MemoryView>(
        &self,
        memory: &mut M,
        mut addr: u64,
        instrs: Option<usize>,
        mut callback: impl FnMut(DecodedInstruction),
    ) -> Result<(), DebugError> {
        const MAX_INSTRUCTION_LEN: usize = 16;
        let mut produced = 0usize;

        loop {
            if let Some(limit) = instrs {
                if produced >= limit {
                    break;
                }
            }

            let mut buf = [0u8; MAX_INSTRUCTION_LEN];
            memory.read(addr, &mut buf)?;

            let mut decoder = Decoder::with_ip(self.bitness, &buf, addr, DecoderOptions::NONE);
            if !decoder.can_decode() {
                break;
            }
            let instruction: Instruction = decoder.decode();
            if instruction.is_invalid() {
                break;
            }

            let len = instruction.len();
            let mut formatter = iced_x86::IntelFormatter::new();
            let mut text = String::new();
            formatter.format(&instruction, &mut text);

            callback(DecodedInstruction {
                addr,
                bytes: buf[..len].to_vec(),
                text,
            });

            addr += len as u64;
            produced += 1;
        }

        Ok(())
    }

    /// Walk the call stack from the current `pc`/`frame_pointer`, invoking
    /// `callback` with each `(pc, frame_pointer)` pair found. This is a
    /// direct port of the source's `StackTrace`: it special-cases a
    /// function's prologue (`mov bp, sp` before the frame pointer is set
    /// up) and epilogue (`push bp` / `ret`), then follows the standard
    /// `[frame] -> saved frame pointer`, `[frame+ptrsize] -> return
    /// address` chain.
    pub fn stack_trace<M: MemoryView>(
        &self,
        memory: &mut M,
        pc: u64,
        frame_pointer: u64,
        stack_pointer: u64,
        mut callback: impl FnMut(StackFrame) -> bool,
    ) -> Result<(), DebugError> {
        let ptr_size = (self.bitness / 8) as u64;

        let mut ip = pc;
        let mut frame = frame_pointer;

        if !callback(StackFrame { pc: ip, frame_pointer: frame }) {
            return Ok(());
        }

        let mut buf = [0u8; 16];
        memory.read(ip, &mut buf)?;

        let mut decoder = Decoder::new(self.bitness, &buf, DecoderOptions::NONE);
        if decoder.can_decode() {
            let instr = decoder.decode();

            if is_mov_frame_from_stack(&instr) {
                // Prologue hasn't pushed the old frame pointer yet; the
                // live frame is still addressed via the stack pointer.
                frame = stack_pointer;
            } else if is_push_frame_pointer(&instr) || instr.mnemonic() == Mnemonic::Ret {
                // Either about to push the caller's frame pointer, or
                // about to return: the return address sits at [sp].
                let mut return_addr_bytes = [0u8; 8];
                memory.read(stack_pointer, &mut return_addr_bytes[..ptr_size as usize])?;
                let return_addr = u64::from_le_bytes(return_addr_bytes);

                if return_addr != 0 {
                    ip = return_addr;
                    if !callback(StackFrame { pc: ip, frame_pointer: frame }) {
                        return Ok(());
                    }
                }
            }
        }

        while ip != 0 && frame != 0 {
            let mut ptrs = [0u8; 16];
            memory.read(frame, &mut ptrs[..(ptr_size as usize) * 2])?;

            let next_frame = u64::from_le_bytes(ptrs[..8].try_into().unwrap());
            let return_addr = u64::from_le_bytes(ptrs[8..16].try_into().unwrap());

            frame = next_frame;
            ip = return_addr;

            if ip != 0 && !callback(StackFrame { pc: ip, frame_pointer: frame }) {
                break;
            }
        }

        Ok(())
    }
}

fn is_mov_frame_from_stack(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op_count() == 2
        && instr.op0_kind() == OpKind::Register
        && instr.op1_kind() == OpKind::Register
        && is_frame_pointer(instr.op0_register())
        && is_stack_pointer(instr.op1_register())
}

fn is_push_frame_pointer(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Push
        && instr.op_count() == 1
        && instr.op0_kind() == OpKind::Register
        && is_frame_pointer(instr.op0_register())
}

fn is_frame_pointer(register: IcedRegister) -> bool {
    matches!(register, IcedRegister::EBP | IcedRegister::RBP)
}

fn is_stack_pointer(register: IcedRegister) -> bool {
    matches!(register, IcedRegister::ESP | IcedRegister::RSP)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SliceMemory<'slice> {
        base: u64,
        data: &'slice [u8],
    }

    impl<'slice> MemoryView for SliceMemory<'slice> {
        fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DebugError> {
            let start = (addr - self.base) as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }
    }

    #[test]
    fn instruction_length_of_nop_is_one() {
        let cpu = Cpu::new(64);
        assert_eq!(cpu.instruction_length(&[0x90]), 1);
    }

    #[test]
    fn instruction_length_of_mov_rax_imm32() {
        let cpu = Cpu::new(64);
        // mov eax, 0x11223344
        let bytes = [0xb8, 0x44, 0x33, 0x22, 0x11];
        assert_eq!(cpu.instruction_length(&bytes), 5);
    }

    #[test]
    fn generate_breakpoint_is_int3() {
        let cpu = Cpu::new(64);
        let mut buf = [0x90u8; 4];
        cpu.generate_breakpoint(&mut buf);
        assert_eq!(buf[0], 0xCC);
    }

    #[test]
    fn on_breakpoint_hit_rewinds_pc() {
        let cpu = Cpu::new(64);
        assert_eq!(cpu.on_breakpoint_hit(0x1001), 0x1000);
    }

    #[test]
    fn stack_trace_follows_frame_chain() {
        let cpu = Cpu::new(64);

        // Memory layout: a two-deep frame chain rooted at 0x2000, with a
        // non-prologue/epilogue instruction at the current pc so no
        // special-cased adjustment applies.
        let mut data = vec![0u8; 0x40];
        // current instruction: nop (no frame adjustment).
        data[0] = 0x90;
        // frame at offset 0x20: [saved_frame=0, return_addr=0] (root).
        data[0x20..0x28].copy_from_slice(&0u64.to_le_bytes());
        data[0x28..0x30].copy_from_slice(&0u64.to_le_bytes());

        let mut memory = SliceMemory { base: 0x1000, data: &data };

        let mut frames = Vec::new();
        cpu.stack_trace(&mut memory, 0x1000, 0x1020, 0x1010, |frame| {
            frames.push(frame);
            true
        })
        .unwrap();

        assert_eq!(frames[0].pc, 0x1000);
        assert_eq!(frames[0].frame_pointer, 0x1020);
        // Root frame has a null return address, so the chain stops here.
        assert_eq!(frames.len(), 1);
    }
}
