//! Process-wide protection-fault interception.
//!
//! Installed behind a refcount: the first live [`AddressSpace`] installs the
//! host fault notifier (saving whatever was there before), the last one to go
//! restores it. Every fault in the process funnels through [`dispatch`]:
//!
//! ```text
//! fault ──▶ owning space? ──no──▶ Foreign (chain to previous handler)
//!               │yes
//!               ▼
//!        registered handler? ──no──▶ Fatal (bus error, terminate)
//!               │yes
//!               ▼
//!        decode instruction ──fail──▶ Fatal
//!               │ok
//!               ▼
//!        run read/write callback, patch trapped context, resume
//! ```
//!
//! The resolution steps are read-only and allocation-free (two read locks and
//! one `Arc` clone); faults can arrive on any thread at any time, including
//! while another thread is registering handlers.
//!
//! [`AddressSpace`]: crate::AddressSpace

use std::cell::Cell;
use std::ops::Range;
use std::sync::{Arc, Mutex, RwLock};

use span_map::{InsertError, SpanMap};

use crate::arch::{self, AccessKind, DecodedAccess, Extend, StoreSrc};
use crate::handler::{AccessHandler, AccessWidth};
use crate::sys::{self, TrapContext};
use crate::Result;

/// The fault interceptor's view of one live [`AddressSpace`]: its bounds and
/// its handler registry.
///
/// [`AddressSpace`]: crate::AddressSpace
pub(crate) struct SpaceShared {
    base: usize,
    len: usize,
    handlers: RwLock<SpanMap<usize, Arc<dyn AccessHandler>>>,
}

impl core::fmt::Debug for SpaceShared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpaceShared")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish_non_exhaustive()
    }
}

impl SpaceShared {
    pub(crate) fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            handlers: RwLock::new(SpanMap::new()),
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.len
    }

    pub(crate) fn insert_handlers(
        &self,
        range: Range<usize>,
        handler: Arc<dyn AccessHandler>,
    ) -> core::result::Result<(), InsertError> {
        self.handlers.write().unwrap().insert(range, handler)
    }

    pub(crate) fn remove_handlers(&self, range: Range<usize>) -> bool {
        self.handlers.write().unwrap().remove(range).is_some()
    }
}

/// All live reservations, searched by the fault path.
static SPACES: RwLock<Vec<Arc<SpaceShared>>> = RwLock::new(Vec::new());
/// Live-reservation count guarding notifier install/restore.
static LIVE_SPACES: Mutex<usize> = Mutex::new(0);

thread_local! {
    /// Set while this thread is emulating an access; a second fault underneath
    /// it means the handler callback itself faulted, which has no sane
    /// recovery.
    static IN_FAULT: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn register(space: Arc<SpaceShared>) -> Result<()> {
    let mut live = LIVE_SPACES.lock().unwrap();
    if *live == 0 {
        // Safety: installs/restores are serialized by the LIVE_SPACES lock
        unsafe { sys::install_fault_handler()? };
    }
    SPACES.write().unwrap().push(space);
    *live += 1;
    Ok(())
}

pub(crate) fn deregister(space: &Arc<SpaceShared>) {
    let mut live = LIVE_SPACES.lock().unwrap();
    SPACES
        .write()
        .unwrap()
        .retain(|other| !Arc::ptr_eq(other, space));
    *live -= 1;
    if *live == 0 {
        // Safety: serialized by the LIVE_SPACES lock; a handler was installed
        // when the count went 0 -> 1
        unsafe { sys::restore_fault_handler() };
    }
}

/// What the platform layer should do with a trapped fault.
pub(crate) enum Disposition {
    /// The access was emulated and the context patched; resume execution.
    Resumed,
    /// The fault does not belong to any live reservation; re-raise it
    /// unchanged.
    Foreign,
    /// The fault is ours but has no defined emulation; terminate the process.
    Fatal(&'static str),
}

/// Resolve and emulate one trapped fault. Runs in signal context: nothing on
/// this path logs, allocates (past one `Arc` clone), or takes a write lock.
pub(crate) fn dispatch(fault_addr: usize, ctx: &mut TrapContext) -> Disposition {
    let Some(space) = owning_space(fault_addr) else {
        return Disposition::Foreign;
    };

    if IN_FAULT.with(|flag| flag.replace(true)) {
        return Disposition::Fatal("fastmem: recursive fault while emulating an access");
    }
    let disposition = emulate(&space, fault_addr - space.base, ctx);
    IN_FAULT.with(|flag| flag.set(false));
    disposition
}

fn owning_space(addr: usize) -> Option<Arc<SpaceShared>> {
    let spaces = SPACES.read().unwrap();
    spaces.iter().find(|space| space.contains(addr)).cloned()
}

fn emulate(space: &SpaceShared, offset: usize, ctx: &mut TrapContext) -> Disposition {
    // A multi-byte access straddling the interval's end still starts inside
    // it; it is routed here by its start address with its full width.
    let handler = {
        let handlers = space.handlers.read().unwrap();
        match handlers.query(offset) {
            Some(handler) => Arc::clone(handler),
            None => {
                return Disposition::Fatal(
                    "fastmem: access to reserved address with no registered handler",
                );
            }
        }
    };

    let Some(access) = decode_at(ctx.pc()) else {
        return Disposition::Fatal("fastmem: cannot decode faulting instruction");
    };

    match access.kind {
        AccessKind::Load {
            reg,
            high_byte,
            dst_bytes,
            ext,
        } => {
            let value = handler.read(offset, access.width);
            write_dest(ctx, reg, high_byte, dst_bytes, extend(value, access.width, ext));
        }
        AccessKind::Store { src } => {
            let value = match src {
                StoreSrc::Reg { reg, high_byte } => {
                    let raw = ctx.read_reg(reg);
                    if high_byte {
                        (raw >> 8) & 0xff
                    } else {
                        raw & access.width.mask()
                    }
                }
                StoreSrc::Imm(imm) => imm & access.width.mask(),
            };
            handler.write(offset, access.width, value);
        }
    }

    if let Some((reg, delta)) = access.writeback {
        let base = ctx.read_reg(reg);
        ctx.write_reg(reg, base.wrapping_add_signed(delta));
    }

    ctx.set_pc(ctx.pc() + access.len as usize);
    Disposition::Resumed
}

fn decode_at(pc: usize) -> Option<DecodedAccess> {
    // Safety: pc points at the instruction that just executed far enough to
    // fault on its data access, so its bytes are mapped; the decoder never
    // reads past the instruction it is parsing.
    let code = unsafe { core::slice::from_raw_parts(pc as *const u8, arch::MAX_INSTR_LEN) };
    arch::decode(code)
}

/// Widen the handler-produced value from the access width to 64 bits.
fn extend(value: u64, width: AccessWidth, ext: Extend) -> u64 {
    let value = value & width.mask();
    match ext {
        Extend::Zero => value,
        Extend::Sign => {
            let shift = 64 - 8 * width.bytes() as u32;
            (((value << shift) as i64) >> shift) as u64
        }
    }
}

/// Write a load result into the trapped context with the destination's
/// merge semantics: 8- and 16-bit destinations preserve the register's upper
/// bits, 32-bit destinations zero them (both ISAs agree on this), 64-bit
/// destinations replace the register.
fn write_dest(ctx: &mut TrapContext, reg: u8, high_byte: bool, dst_bytes: u8, value: u64) {
    let merged = match dst_bytes {
        8 => value,
        4 => value & 0xffff_ffff,
        2 => (ctx.read_reg(reg) & !0xffff) | (value & 0xffff),
        1 if high_byte => (ctx.read_reg(reg) & !0xff00) | ((value & 0xff) << 8),
        1 => (ctx.read_reg(reg) & !0xff) | (value & 0xff),
        _ => unreachable!("destination register width is 1, 2, 4, or 8 bytes"),
    };
    ctx.write_reg(reg, merged);
}
