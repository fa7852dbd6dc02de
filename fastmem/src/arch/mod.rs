//! Per-ISA decoding of faulting load/store instructions.
//!
//! The fault interceptor only knows the faulting *address*; the access's
//! width, direction, and operand register have to be recovered from the
//! instruction the trapped program counter points at. Decoders are pure
//! functions over the instruction bytes, so they are unit-testable without
//! ever taking a real fault.
//!
//! Only the integer load/store forms compilers emit for volatile memory
//! accesses are recognized. Anything else (SIMD, atomics, string ops) decodes
//! to `None`, and the fault becomes fatal; an emulated device has no
//! meaningful response to such an access anyway.

use crate::handler::AccessWidth;

/// How a load widens into its destination register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Extend {
    /// Upper bits cleared (or preserved, for sub-32-bit destinations).
    Zero,
    /// Upper bits copied from the loaded value's sign bit.
    Sign,
}

/// The source operand of an emulated store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreSrc {
    /// A general-purpose register, by the platform layer's numbering.
    Reg { reg: u8, high_byte: bool },
    /// An immediate embedded in the instruction.
    Imm(u64),
}

/// Direction plus operand description of a decoded access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessKind {
    /// A load into `reg`, writing `dst_bytes` of it with `ext` widening.
    Load {
        reg: u8,
        high_byte: bool,
        dst_bytes: u8,
        ext: Extend,
    },
    /// A store of `src`.
    Store { src: StoreSrc },
}

/// A successfully decoded faulting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodedAccess {
    /// Instruction length in bytes; execution resumes at `pc + len`.
    pub(crate) len: u8,
    /// Width of the memory access itself.
    pub(crate) width: AccessWidth,
    pub(crate) kind: AccessKind,
    /// Base-register writeback (register number, signed delta) for
    /// pre/post-indexed addressing, where the ISA has it.
    pub(crate) writeback: Option<(u8, i64)>,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::{MAX_INSTR_LEN, decode};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::{MAX_INSTR_LEN, decode};
    } else {
        compile_error!("no fault decoder for this target architecture");
    }
}
