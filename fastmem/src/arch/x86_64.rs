//! x86_64 decoding of faulting `mov` family instructions.
//!
//! Register numbers follow the hardware encoding (RAX, RCX, RDX, RBX, RSP,
//! RBP, RSI, RDI, R8..R15), which is also the platform layer's numbering for
//! the trapped register context. Without a REX prefix, byte-register
//! encodings 4..7 name AH/CH/DH/BH, the *high byte* of RAX..RBX, which is
//! what the `high_byte` flag carries.

use super::{AccessKind, DecodedAccess, Extend, StoreSrc};
use crate::handler::AccessWidth;

/// x86_64 instructions are at most 15 bytes.
pub(crate) const MAX_INSTR_LEN: usize = 15;

pub(crate) fn decode(code: &[u8]) -> Option<DecodedAccess> {
    let mut i = 0;
    let mut opsize16 = false;

    // Legacy prefixes. LOCK/REP change the instruction (or make it atomic,
    // which cannot be emulated non-atomically anyway) and a 0x67 address-size
    // override changes the ModRM interpretation; all three bail out. Segment
    // overrides only shift the effective address, which the fault already
    // reported, so they are skipped.
    loop {
        match *code.get(i)? {
            0x66 => {
                opsize16 = true;
                i += 1;
            }
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 => i += 1,
            0x67 | 0xf0 | 0xf2 | 0xf3 => return None,
            _ => break,
        }
    }

    // REX comes last, immediately before the opcode.
    let mut rex = 0u8;
    if (0x40..=0x4f).contains(code.get(i)?) {
        rex = code[i];
        i += 1;
    }
    let rex_w = rex & 0b1000 != 0;
    let rex_r = rex & 0b0100 != 0;

    // Operand size of the non-byte forms. REX.W beats a 0x66 prefix.
    let opsize: u8 = if rex_w {
        8
    } else if opsize16 {
        2
    } else {
        4
    };

    let opcode = *code.get(i)?;
    i += 1;

    match opcode {
        // mov r/m8, r8
        0x88 => {
            let (reg_field, end) = modrm(code, i)?;
            let (reg, high_byte) = byte_operand(rex, rex_r, reg_field);
            finish(end, AccessWidth::U8, AccessKind::Store {
                src: StoreSrc::Reg { reg, high_byte },
            })
        }
        // mov r/m, r
        0x89 => {
            let (reg_field, end) = modrm(code, i)?;
            let reg = reg_field | (u8::from(rex_r) << 3);
            finish(end, width_of(opsize), AccessKind::Store {
                src: StoreSrc::Reg {
                    reg,
                    high_byte: false,
                },
            })
        }
        // mov r8, r/m8
        0x8a => {
            let (reg_field, end) = modrm(code, i)?;
            let (reg, high_byte) = byte_operand(rex, rex_r, reg_field);
            finish(end, AccessWidth::U8, AccessKind::Load {
                reg,
                high_byte,
                dst_bytes: 1,
                ext: Extend::Zero,
            })
        }
        // mov r, r/m
        0x8b => {
            let (reg_field, end) = modrm(code, i)?;
            let reg = reg_field | (u8::from(rex_r) << 3);
            finish(end, width_of(opsize), AccessKind::Load {
                reg,
                high_byte: false,
                dst_bytes: opsize,
                ext: Extend::Zero,
            })
        }
        // movsxd r, r/m32
        0x63 => {
            let (reg_field, end) = modrm(code, i)?;
            let reg = reg_field | (u8::from(rex_r) << 3);
            finish(end, AccessWidth::U32, AccessKind::Load {
                reg,
                high_byte: false,
                dst_bytes: if rex_w { 8 } else { 4 },
                ext: Extend::Sign,
            })
        }
        // movzx / movsx
        0x0f => {
            let op2 = *code.get(i)?;
            i += 1;
            let (width, ext) = match op2 {
                0xb6 => (AccessWidth::U8, Extend::Zero),
                0xb7 => (AccessWidth::U16, Extend::Zero),
                0xbe => (AccessWidth::U8, Extend::Sign),
                0xbf => (AccessWidth::U16, Extend::Sign),
                _ => return None,
            };
            let (reg_field, end) = modrm(code, i)?;
            let reg = reg_field | (u8::from(rex_r) << 3);
            finish(end, width, AccessKind::Load {
                reg,
                high_byte: false,
                dst_bytes: opsize,
                ext,
            })
        }
        // mov r/m8, imm8
        0xc6 => {
            let (reg_field, end) = modrm(code, i)?;
            if reg_field != 0 {
                return None;
            }
            let imm = read_imm(code, end, 1)?;
            finish(end + 1, AccessWidth::U8, AccessKind::Store {
                src: StoreSrc::Imm(imm),
            })
        }
        // mov r/m, imm16/32 (sign-extended to 64 under REX.W)
        0xc7 => {
            let (reg_field, end) = modrm(code, i)?;
            if reg_field != 0 {
                return None;
            }
            let imm_bytes = if opsize16 { 2 } else { 4 };
            let mut imm = read_imm(code, end, imm_bytes)?;
            if rex_w {
                imm = ((imm as u32) as i32) as i64 as u64;
            }
            finish(end + imm_bytes, width_of(opsize), AccessKind::Store {
                src: StoreSrc::Imm(imm),
            })
        }
        _ => None,
    }
}

fn width_of(opsize: u8) -> AccessWidth {
    match opsize {
        2 => AccessWidth::U16,
        4 => AccessWidth::U32,
        _ => AccessWidth::U64,
    }
}

fn byte_operand(rex: u8, rex_r: bool, reg_field: u8) -> (u8, bool) {
    if rex == 0 && reg_field >= 4 {
        // AH/CH/DH/BH: high byte of RAX/RCX/RDX/RBX
        (reg_field - 4, true)
    } else {
        (reg_field | (u8::from(rex_r) << 3), false)
    }
}

/// Parses the ModRM byte (and any SIB byte and displacement) at `i`,
/// returning the ModRM `reg` field and the index just past the addressing
/// bytes. Fails for register-direct operands, which cannot fault.
fn modrm(code: &[u8], i: usize) -> Option<(u8, usize)> {
    let m = *code.get(i)?;
    let mut end = i + 1;

    let mode = m >> 6;
    let reg = (m >> 3) & 7;
    let rm = m & 7;

    if mode == 3 {
        return None;
    }

    let mut sib_base = None;
    if rm == 4 {
        let sib = *code.get(end)?;
        end += 1;
        sib_base = Some(sib & 7);
    }

    let disp = match mode {
        0 => {
            if (rm == 5 && sib_base.is_none()) || sib_base == Some(5) {
                // RIP-relative, or SIB with absolute disp32 base
                4
            } else {
                0
            }
        }
        1 => 1,
        _ => 4,
    };
    if disp > 0 {
        // the displacement bytes must be present
        code.get(end + disp - 1)?;
    }

    Some((reg, end + disp))
}

fn read_imm(code: &[u8], at: usize, bytes: usize) -> Option<u64> {
    let mut value = 0u64;
    for (shift, byte) in code.get(at..at + bytes)?.iter().enumerate() {
        value |= u64::from(*byte) << (8 * shift);
    }
    Some(value)
}

fn finish(len: usize, width: AccessWidth, kind: AccessKind) -> Option<DecodedAccess> {
    (len <= MAX_INSTR_LEN).then(|| DecodedAccess {
        len: len as u8,
        width,
        kind,
        writeback: None,
    })
}
