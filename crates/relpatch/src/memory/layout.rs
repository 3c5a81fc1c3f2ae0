//! x86-64 instruction layout constants used by patches and trampoline stubs
//!
//! This module centralizes the opcode bytes and instruction sizes the engine emits or
//! expects at patch sites. Constants are organized by instruction family.

/// Single-byte filler instructions
pub mod filler {
    pub const NOP: u8 = 0x90;
    pub const RET: u8 = 0xC3;
    pub const INT3: u8 = 0xCC;
}

/// Near relative branches (`E8`/`E9` followed by rel32)
pub mod rel32 {
    pub const CALL: u8 = 0xE8;
    pub const JMP: u8 = 0xE9;

    /// Opcode (1) + displacement (4)
    pub const SIZE: usize = 5;
}

/// RIP-relative indirect branches (`FF /2` and `FF /4` with disp32)
pub mod indirect {
    pub const OPCODE: u8 = 0xFF;
    pub const CALL_MODRM: u8 = 0x15;
    pub const JMP_MODRM: u8 = 0x25;

    /// Opcode (1) + ModRM (1) + displacement (4)
    pub const SIZE: usize = 6;
}

/// Absolute branch stub written into the trampoline: `jmp [rip+0]` then the 8-byte target
pub mod abs_jump {
    pub const PREFIX: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

    /// Prefix (6) + absolute target (8)
    pub const SIZE: usize = 14;
}

/// Pointer width of the host
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Displacement size of every branch form above
pub const DISP_SIZE: usize = 4;

/// rel32 displacement from the end of an instruction to `target`.
///
/// Returns `None` when the distance does not fit in a signed 32-bit field.
pub fn displacement(instruction_end: usize, target: usize) -> Option<i32> {
    let delta = (target as i64).wrapping_sub(instruction_end as i64);
    i32::try_from(delta).ok()
}

/// Absolute address reached by a displacement relative to `instruction_end`.
pub fn resolve_displacement(instruction_end: usize, disp: i32) -> usize {
    (instruction_end as i64).wrapping_add(disp as i64) as usize
}
