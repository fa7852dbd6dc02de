//! Page-remapped guest memory with fault-emulated MMIO.
//!
//! Emulators spend most of their time reading and writing guest memory, and
//! the fast path here is exactly as fast as it can be: an [`AddressSpace`]
//! reserves a contiguous chunk of host address space and [`Vmo`]s (shareable
//! backing blocks) are placed into it by editing the host's page tables, so a
//! guest access compiles down to a plain load or store through
//! [`AddressSpace::base_ptr`]. Mapping the same `Vmo` at several offsets
//! mirrors it for free; the aliasing is resolved once, at map time.
//!
//! The interesting part is everything that is *not* plain memory. Ranges left
//! unmapped can be routed to software with
//! [`AddressSpace::add_unmapped_access_handlers`]: touching them raises a
//! hardware protection fault, which a process-wide interceptor catches. The
//! cliff notes of a fault's life:
//!
//! - the signal handler asks which live `AddressSpace` owns the faulting
//!   address; a fault owned by nobody is chained to whatever handler was
//!   installed before us, untouched.
//! - the space's registry resolves the reservation-relative offset to an
//!   [`AccessHandler`]; an unresolved offset is a genuine bus error and
//!   terminates the process, like real hardware would.
//! - the faulting instruction is decoded to recover the access width,
//!   direction, and operand register; the handler's `read`/`write` callback
//!   runs; the trapped register context is patched so the instruction appears
//!   to have completed, and execution resumes right after it.
//!
//! Handler callbacks run on the faulting thread, inside the fault. They must
//! not fault themselves and should not block or allocate.

mod address_space;
mod arch;
mod error;
mod handler;
mod mapping;
mod sys;
mod trap;
mod vmo;

use core::fmt;

pub use address_space::AddressSpace;
pub use error::Error;
pub use handler::{AccessHandler, AccessWidth};
pub use mapping::Mapping;
pub use vmo::Vmo;

pub type Result<T> = core::result::Result<T, Error>;

bitflags::bitflags! {
    /// Access rights of a [`Vmo`]'s mappings.
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Allow reads through mappings of the block
        const READ = 1 << 0;
        /// Allow writes through mappings of the block
        const WRITE = 1 << 1;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

/// Returns the host's page granularity in bytes.
///
/// Reservation sizes are rounded up to this, and mapping offsets and [`Vmo`]
/// sizes must be multiples of it.
#[must_use]
pub fn host_page_size() -> usize {
    sys::page_size()
}

pub(crate) fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
