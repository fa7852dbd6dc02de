use core::ops::Range;
use core::slice;
use std::sync::Arc;

use span_map::{InsertError, SpanMap};

use crate::mapping::Region;
use crate::trap::{self, SpaceShared};
use crate::{AccessHandler, Error, Mapping, Result, Vmo, align_down, align_up, sys};

/// A reserved, contiguous range of host address space that guest memory is
/// assembled into.
///
/// Construction reserves the range with no access rights and commits no
/// storage; [`AddressSpace::map`] then places [`Vmo`]s at page-aligned offsets
/// by editing the host's page tables, and
/// [`AddressSpace::add_unmapped_access_handlers`] routes deliberately
/// unmapped sub-ranges to software. Everything in between stays reserved:
/// touching it is a protection fault with no defined emulation, which
/// terminates the process the way a bus error would.
///
/// The range is exclusively owned; no two `AddressSpace`s overlap. Creating
/// the first one installs the process-wide fault interceptor, dropping the
/// last uninstalls it, and dropping a space tears down all of its mappings
/// and handler registrations.
#[derive(Debug)]
pub struct AddressSpace {
    reservation: sys::Reservation,
    /// Active mappings, keyed by their offset range. Holding [`Region`]s here
    /// keeps every mapped block alive.
    regions: SpanMap<usize, Region>,
    /// The interceptor's view of this space: bounds plus the handler
    /// registry, shared with the fault path.
    shared: Arc<SpaceShared>,
}

impl AddressSpace {
    /// Reserves `size` bytes of address space (rounded up to page
    /// granularity), committing no storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for a zero size and
    /// [`Error::OutOfAddressSpace`] if the host cannot satisfy the
    /// reservation.
    pub fn new(size: usize) -> Result<Self> {
        let page = sys::page_size();
        let len = size
            .checked_add(page - 1)
            .ok_or(Error::OutOfAddressSpace)?
            & !(page - 1);
        if len == 0 {
            return Err(Error::OutOfBounds);
        }

        let reservation = sys::Reservation::reserve(len)?;
        let shared = Arc::new(SpaceShared::new(reservation.base(), len));
        trap::register(Arc::clone(&shared))?;

        log::trace!("reserved {len:#x} bytes at {:#x}", reservation.base());
        Ok(Self {
            reservation,
            regions: SpanMap::new(),
            shared,
        })
    }

    /// The reservation's size in bytes (the requested size rounded up to page
    /// granularity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.reservation.len()
    }

    /// Whether the reservation is zero-sized (never true for a constructed
    /// space).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservation.len() == 0
    }

    /// Returns a pointer to the start of the reserved range.
    ///
    /// Offsets into the range are plain pointer arithmetic on this; accesses
    /// land in mapped blocks at native speed and in handled or reserved
    /// ranges via the fault path.
    #[must_use]
    pub fn base_ptr(&self) -> *mut u8 {
        self.reservation.base() as *mut u8
    }

    /// Returns a slice over `range` of the reservation.
    ///
    /// # Safety
    ///
    /// Every byte of `range` must be inside a readable mapping, and the
    /// caller must uphold the usual aliasing rules, including against writers
    /// going through mirrors of the underlying blocks.
    ///
    /// # Panics
    ///
    /// Panics if `range` extends past the reservation.
    #[must_use]
    pub unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        assert!(range.end <= self.len());
        let len = range.end.checked_sub(range.start).unwrap();
        // Safety: in-bounds by the assert; readability upheld by the caller
        unsafe { slice::from_raw_parts(self.base_ptr().add(range.start), len) }
    }

    /// Returns a mutable slice over `range` of the reservation.
    ///
    /// # Safety
    ///
    /// As [`AddressSpace::slice`], with writable mappings and exclusive
    /// access.
    ///
    /// # Panics
    ///
    /// Panics if `range` extends past the reservation.
    #[must_use]
    pub unsafe fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        assert!(range.end <= self.len());
        let len = range.end.checked_sub(range.start).unwrap();
        // Safety: in-bounds by the assert; writability upheld by the caller
        unsafe { slice::from_raw_parts_mut(self.base_ptr().add(range.start), len) }
    }

    /// Maps `vmo` at `offset`, making `[offset, offset + vmo.len())` resolve
    /// to the block's storage with the block's permissions.
    ///
    /// The same block may be mapped at several offsets (and into several
    /// spaces) at once; all such mappings alias the same storage, so a write
    /// through one is immediately visible through every other and through
    /// [`Vmo::read_at`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnalignedOffset`], [`Error::OutOfBounds`], or
    /// [`Error::AlreadyMapped`] when a precondition fails, and
    /// [`Error::Host`] if the host refuses the mapping. All are recoverable;
    /// probing occupied ranges is fine.
    pub fn map(&mut self, vmo: &Arc<Vmo>, offset: usize) -> Result<Mapping> {
        if offset % sys::page_size() != 0 {
            return Err(Error::UnalignedOffset);
        }
        let end = offset.checked_add(vmo.len()).ok_or(Error::OutOfBounds)?;
        if end > self.len() {
            return Err(Error::OutOfBounds);
        }

        self.regions
            .insert(
                offset..end,
                Region {
                    vmo: Arc::clone(vmo),
                },
            )
            .map_err(|_| Error::AlreadyMapped)?;

        let addr = self.reservation.base() + offset;
        if let Err(err) = sys::map_backing(addr, vmo.len(), vmo.backing(), vmo.permissions()) {
            self.regions.remove(offset..end);
            return Err(err);
        }

        log::trace!(
            "mapped {:#x} byte block at offset {offset:#x} with permissions {}",
            vmo.len(),
            vmo.permissions()
        );
        Ok(Mapping::new(addr as *mut u8, offset, vmo.len()))
    }

    /// Removes `mapping`, returning its range to the reserved no-access state
    /// so any further touch goes through the fault path.
    ///
    /// Returns `false` if the mapping is not currently active; unmapping the
    /// same handle twice reports the second call rather than failing.
    pub fn unmap(&mut self, mapping: &Mapping) -> bool {
        let Some(end) = mapping.offset().checked_add(mapping.len()) else {
            return false;
        };
        let span = mapping.offset()..end;
        if self.regions.remove(span.clone()).is_none() {
            return false;
        }

        if let Err(err) = sys::protect_none(self.reservation.base() + span.start, mapping.len()) {
            log::error!("failed to re-protect unmapped range {span:#x?}: {err}");
        }
        log::trace!("unmapped offset range {span:#x?}");
        true
    }

    /// Declares that accesses into `[range.start, range.end)`, which must
    /// not hold an active mapping, are emulated by `handler`.
    ///
    /// Offsets handed to the handler are reservation-relative, matching
    /// `range`. The covering pages are (re-)protected to no-access so the
    /// accesses trap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for an empty or out-of-range interval,
    /// [`Error::AlreadyMapped`] if it intersects an active mapping, and
    /// [`Error::OverlappingRegistration`] if it intersects an existing
    /// registration; ownership of an address is never ambiguous.
    pub fn add_unmapped_access_handlers(
        &mut self,
        range: Range<usize>,
        handler: Arc<dyn AccessHandler>,
    ) -> Result<()> {
        if range.start >= range.end || range.end > self.len() {
            return Err(Error::OutOfBounds);
        }
        if self.regions.overlaps(&range) {
            return Err(Error::AlreadyMapped);
        }

        self.shared
            .insert_handlers(range.clone(), handler)
            .map_err(|err| match err {
                InsertError::Overlap => Error::OverlappingRegistration,
                InsertError::Empty => unreachable!("empty intervals rejected above"),
            })?;

        // The interval itself need not be page aligned, but since mappings are
        // and the overlap check passed, the covering pages hold no mapping.
        let page = sys::page_size();
        let start = align_down(range.start, page);
        let end = align_up(range.end, page);
        if let Err(err) = sys::protect_none(self.reservation.base() + start, end - start) {
            self.shared.remove_handlers(range);
            return Err(err);
        }

        log::trace!("registered access handlers for {range:#x?}");
        Ok(())
    }

    /// Removes the handler registration exactly matching `range`'s bounds.
    ///
    /// Returns `false` if no such registration exists, symmetric with
    /// [`AddressSpace::unmap`]. Accesses into the freed interval become
    /// unhandled (fatal) again until remapped or re-registered.
    pub fn remove_unmapped_access_handlers(&mut self, range: Range<usize>) -> bool {
        let removed = self.shared.remove_handlers(range.clone());
        if removed {
            log::trace!("removed access handlers for {range:#x?}");
        }
        removed
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Deregistration drops this space's handler registrations with it;
        // the reservation then unmaps the whole range, aliases included.
        trap::deregister(&self.shared);
    }
}
