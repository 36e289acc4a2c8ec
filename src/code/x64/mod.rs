//! x86 and x86-64 jump encodings

/// Size of [`jmp_abs`]
pub const JMP_ABS_LEN: usize = 14;
/// Size of [`jmp_rel32`]
pub const JMP_REL32_LEN: usize = 5;

/// Absolute jmp instruction (jmp [rip + 0]), followed by the 8-byte target
const JMP_ABS_OPCODE: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];
/// Near relative jmp opcode, followed by a 4-byte displacement from the end of the instruction
const JMP_REL32_OPCODE: u8 = 0xe9;

/// Generates an absolute jump to a specified address and returns bytecode
///
/// Only valid in 64-bit mode, where the `ff 25` form is rip-relative.
pub fn jmp_abs(target: u64) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..JMP_ABS_OPCODE.len()].copy_from_slice(&JMP_ABS_OPCODE);
    code[JMP_ABS_OPCODE.len()..].copy_from_slice(&target.to_le_bytes());
    code
}

/// Generates a relative jump placed at `source` that lands on `target`
///
/// Returns `None` when `target` is further than a signed 32-bit displacement can reach.
pub fn jmp_rel32(source: u64, target: u64) -> Option<[u8; JMP_REL32_LEN]> {
    let next = source.wrapping_add(JMP_REL32_LEN as u64);
    let displacement = i32::try_from(target.wrapping_sub(next) as i64).ok()?;

    let mut code = [0u8; JMP_REL32_LEN];
    code[0] = JMP_REL32_OPCODE;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// Generates a relative jump for 32-bit mode, where the displacement wraps around the address space
pub fn jmp_rel32_wrapping(source: u32, target: u32) -> [u8; JMP_REL32_LEN] {
    let displacement = target.wrapping_sub(source.wrapping_add(JMP_REL32_LEN as u32));

    let mut code = [0u8; JMP_REL32_LEN];
    code[0] = JMP_REL32_OPCODE;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    code
}
