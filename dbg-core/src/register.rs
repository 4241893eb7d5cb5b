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

use std::fmt;

/// The dense, stable register catalog shared by every backend. Indices into
/// this enum are the "register index" of the external interface; each
/// backend maps a `Register` to a concrete field in its OS register struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Register {
    Ax = 0,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Sp,
    Bp,
    Ip,
    Flags,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

struct RegisterInfo {
    register: Register,
    name: &'static str,
    size: usize,
}

// Register-catalog table, built once, looked up by index or name. This is
// the table the source's `DBG_EVAL_REGISTER` macro expansion stands in for.
const REGISTERS: &[RegisterInfo] = &[
    RegisterInfo { register: Register::Ax, name: "rax", size: 8 },
    RegisterInfo { register: Register::Bx, name: "rbx", size: 8 },
    RegisterInfo { register: Register::Cx, name: "rcx", size: 8 },
    RegisterInfo { register: Register::Dx, name: "rdx", size: 8 },
    RegisterInfo { register: Register::Si, name: "rsi", size: 8 },
    RegisterInfo { register: Register::Di, name: "rdi", size: 8 },
    RegisterInfo { register: Register::Sp, name: "rsp", size: 8 },
    RegisterInfo { register: Register::Bp, name: "rbp", size: 8 },
    RegisterInfo { register: Register::Ip, name: "rip", size: 8 },
    RegisterInfo { register: Register::Flags, name: "rflags", size: 8 },
    RegisterInfo { register: Register::R8, name: "r8", size: 8 },
    RegisterInfo { register: Register::R9, name: "r9", size: 8 },
    RegisterInfo { register: Register::R10, name: "r10", size: 8 },
    RegisterInfo { register: Register::R11, name: "r11", size: 8 },
    RegisterInfo { register: Register::R12, name: "r12", size: 8 },
    RegisterInfo { register: Register::R13, name: "r13", size: 8 },
    RegisterInfo { register: Register::R14, name: "r14", size: 8 },
    RegisterInfo { register: Register::R15, name: "r15", size: 8 },
];

/// `DBG_REGISTER_COUNT` on 64-bit: 10 general registers plus R8..R15.
pub const REGISTER_COUNT: usize = REGISTERS.len();

impl Register {
    pub fn from_index(index: usize) -> Option<Register> {
        REGISTERS.get(index).map(|info| info.register)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        REGISTERS[self.index()].name
    }

    pub fn size(self) -> usize {
        REGISTERS[self.index()].size
    }

    /// Name lookup is case-sensitive and exact.
    pub fn by_name(name: &str) -> Option<Register> {
        REGISTERS
            .iter()
            .find(|info| info.name == name)
            .map(|info| info.register)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_round_trips_by_name() {
        for index in 0..REGISTER_COUNT {
            let register = Register::from_index(index).unwrap();
            assert_eq!(Register::by_name(register.name()), Some(register));
        }
    }

    #[test]
    fn name_lookup_is_case_sensitive() {
        assert_eq!(Register::by_name("RAX"), None);
        assert_eq!(Register::by_name("rax"), Some(Register::Ax));
    }

    #[test]
    fn unknown_name_is_none() {
        assert_eq!(Register::by_name("not-a-register"), None);
    }
}
