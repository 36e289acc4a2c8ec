//! Instruction-boundary analysis of a function's entry point
//!
//! A trampoline overwrites the first few bytes of a function. Those bytes must all belong to the
//! function itself: if its body returns (or falls into padding) before the trampoline is covered,
//! the patch would clobber whatever comes next in memory.

use std::slice;

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use thiserror::Error;

/// Longest encodable x86 instruction
pub const MAX_INSTR_LEN: usize = 15;

/// Errors while analysing the entry of a function
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes at the entry don't decode to a valid instruction
    #[error("invalid instruction at offset {offset}")]
    Invalid {
        /// Offset from the entry point
        offset: usize,
    },
    /// The function body ends before the trampoline fits
    #[error("function body ends after {available} bytes but the trampoline needs {required}")]
    TooSmall {
        /// Bytes of the body before control leaves it
        available: usize,
        /// Trampoline size
        required: usize,
    },
    /// The bytes following the entry aren't mapped readable
    #[error("memory at {address:#x} is not readable")]
    Unreadable {
        /// Entry point that was queried
        address: usize,
    },
}

/// Whether control never falls through past this instruction
fn ends_body(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return
            | FlowControl::Interrupt
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
    )
}

/// Measures how many bytes of whole instructions starting at `code` are needed to cover `size` bytes
///
/// # Safety
///
/// `code` must point at the entry of a function in mapped memory
pub unsafe fn covered_len(code: *const u8, size: usize, bitness: u32) -> Result<usize, DecodeError> {
    // Add MAX_INSTR_LEN - 1 in case the window ends on the first byte of the longest instruction
    let max_size = size + MAX_INSTR_LEN - 1;
    let readable = region::query_range(code, max_size)
        .map(|mut regions| regions.all(|r| r.map(|r| r.is_readable()).unwrap_or(false)))
        .unwrap_or(false);
    if !readable {
        return Err(DecodeError::Unreadable {
            address: code as usize,
        });
    }

    let buf = slice::from_raw_parts(code, max_size);
    covered_len_in(buf, code as u64, size, bitness)
}

/// Same as [`covered_len`] but over an in-memory copy of the code, decoded as if it lived at `ip`
pub fn covered_len_in(buf: &[u8], ip: u64, size: usize, bitness: u32) -> Result<usize, DecodeError> {
    let mut decoder = Decoder::with_ip(bitness, buf, ip, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut covered = 0usize;

    while covered < size {
        if !decoder.can_decode() {
            return Err(DecodeError::TooSmall {
                available: covered,
                required: size,
            });
        }
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            return Err(DecodeError::Invalid { offset: covered });
        }
        covered += instruction.len();
        if covered < size && ends_body(&instruction) {
            return Err(DecodeError::TooSmall {
                available: covered,
                required: size,
            });
        }
    }

    Ok(covered)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// push rbp; mov rbp, rsp; sub rsp, 0x20; mov [rbp-4], edi; mov eax, [rbp-4]; leave; ret
    const FRAME: [u8; 16] = [
        0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x20, 0x89, 0x7d, 0xfc, 0x8b, 0x45, 0xfc, 0xc9,
        0xc3,
    ];

    #[test]
    fn covers_whole_instructions() {
        assert_eq!(covered_len_in(&FRAME, 0x1000, 14, 64), Ok(14));
        // sub rsp, 0x20 straddles byte 5, so the window grows to 8
        assert_eq!(covered_len_in(&FRAME, 0x1000, 5, 64), Ok(8));
    }

    #[test]
    fn rejects_body_shorter_than_trampoline() {
        // lea eax, [rdi+1]; ret; int3 padding
        let tiny = [0x8d, 0x47, 0x01, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc];
        assert_eq!(
            covered_len_in(&tiny, 0x1000, 5, 64),
            Err(DecodeError::TooSmall {
                available: 4,
                required: 5
            })
        );
    }

    #[test]
    fn rejects_invalid_instruction() {
        // push es doesn't exist in 64-bit mode
        assert_eq!(
            covered_len_in(&[0x06, 0x90, 0x90, 0x90, 0x90, 0x90], 0x1000, 5, 64),
            Err(DecodeError::Invalid { offset: 0 })
        );
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert_eq!(
            covered_len_in(&[0x90, 0x90], 0x1000, 5, 64),
            Err(DecodeError::TooSmall {
                available: 2,
                required: 5
            })
        );
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn live_function_entry() {
        #[inline(never)]
        extern "C" fn spin(rounds: u32) -> u32 {
            let mut acc = std::hint::black_box(0u32);
            for i in 0..std::hint::black_box(rounds) {
                acc = acc.wrapping_mul(31).wrapping_add(i);
            }
            acc
        }

        spin(3);
        let covered = unsafe { covered_len(spin as *const u8, 5, 64) }.unwrap();
        assert!(covered >= 5);
    }
}
