//! AArch64 decoding of faulting load/store register instructions.
//!
//! Fixed 4-byte instructions make this far simpler than x86_64: every form we
//! care about (LDR/STR and the sign-extending loads, with unsigned-immediate,
//! unscaled, register-offset, and pre/post-indexed addressing) shares the
//! same size/opc/Rt field layout. Register numbers are the architectural
//! X0..X30; Rt = 31 is XZR/WZR, which the platform layer reads as zero and
//! discards writes to.

use super::{AccessKind, DecodedAccess, Extend, StoreSrc};
use crate::handler::AccessWidth;

/// AArch64 instructions are always 4 bytes.
pub(crate) const MAX_INSTR_LEN: usize = 4;

pub(crate) fn decode(code: &[u8]) -> Option<DecodedAccess> {
    let insn = u32::from_le_bytes(code.get(..4)?.try_into().ok()?);

    // Load/store register class: bits 29:27 are 0b111. Pairs, exclusives,
    // and acquire/release forms live elsewhere and are rejected.
    if (insn >> 27) & 0b111 != 0b111 {
        return None;
    }
    // V set means a SIMD/FP register transfer.
    if (insn >> 26) & 1 != 0 {
        return None;
    }

    let size = (insn >> 30) & 0b11;
    let opc = (insn >> 22) & 0b11;
    let rt = (insn & 0x1f) as u8;
    let rn = ((insn >> 5) & 0x1f) as u8;

    let mut writeback = None;
    match (insn >> 24) & 0b11 {
        // unsigned immediate offset
        0b01 => {}
        0b00 => {
            if (insn >> 21) & 1 == 1 {
                // register offset requires bits 11:10 == 0b10
                if (insn >> 10) & 0b11 != 0b10 {
                    return None;
                }
            } else {
                match (insn >> 10) & 0b11 {
                    // unscaled offset (LDUR/STUR)
                    0b00 => {}
                    // post/pre-indexed: the base register is updated by the
                    // signed 9-bit immediate either way
                    0b01 | 0b11 => {
                        if rn == 31 {
                            // writeback to SP is not worth emulating
                            return None;
                        }
                        let imm9 = i64::from((insn >> 12) & 0x1ff);
                        writeback = Some((rn, (imm9 << 55) >> 55));
                    }
                    // unprivileged LDTR/STTR
                    _ => return None,
                }
            }
        }
        _ => return None,
    }

    let width = match size {
        0b00 => AccessWidth::U8,
        0b01 => AccessWidth::U16,
        0b10 => AccessWidth::U32,
        _ => AccessWidth::U64,
    };

    let kind = match opc {
        // STR/STRB/STRH
        0b00 => AccessKind::Store {
            src: StoreSrc::Reg {
                reg: rt,
                high_byte: false,
            },
        },
        // LDR/LDRB/LDRH: zero-extend into Wt (Xt for 64-bit)
        0b01 => AccessKind::Load {
            reg: rt,
            high_byte: false,
            dst_bytes: if size == 0b11 { 8 } else { 4 },
            ext: Extend::Zero,
        },
        // LDRSB/LDRSH/LDRSW into Xt; size 0b11 here is PRFM, not an access
        0b10 => {
            if size == 0b11 {
                return None;
            }
            AccessKind::Load {
                reg: rt,
                high_byte: false,
                dst_bytes: 8,
                ext: Extend::Sign,
            }
        }
        // LDRSB/LDRSH into Wt
        _ => {
            if size >= 0b10 {
                return None;
            }
            AccessKind::Load {
                reg: rt,
                high_byte: false,
                dst_bytes: 4,
                ext: Extend::Sign,
            }
        }
    };

    Some(DecodedAccess {
        len: 4,
        width,
        kind,
        writeback,
    })
}
