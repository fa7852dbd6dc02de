use crate::sys;
use crate::{Error, Permissions, Result};

/// A backing memory object: a block of storage that can be mapped into an
/// [`AddressSpace`] at many offsets at once.
///
/// The storage is a single shareable host allocation, which is what makes
/// mirroring possible: every mapping of the same `Vmo` resolves to the same
/// bytes through the host's page tables. A plain private allocation could not
/// be aliased this way.
///
/// A `Vmo` is created independently of any address space and is typically
/// passed around as `Arc<Vmo>`; each mapping holds a clone, so the block
/// cannot be dropped while any mapping of it is live.
///
/// [`AddressSpace`]: crate::AddressSpace
#[derive(Debug)]
pub struct Vmo {
    backing: sys::Backing,
    len: usize,
    permissions: Permissions,
}

impl Vmo {
    /// Allocates a backing block of `len` bytes whose mappings carry
    /// `permissions`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnalignedSize`] unless `len` is a non-zero multiple of
    /// [`host_page_size`], and [`Error::Host`] if the host allocation fails.
    ///
    /// [`host_page_size`]: crate::host_page_size
    pub fn new(len: usize, permissions: Permissions) -> Result<Self> {
        if len == 0 || len % sys::page_size() != 0 {
            return Err(Error::UnalignedSize);
        }
        let backing = sys::Backing::new(len)?;
        log::trace!("created {len:#x} byte backing with permissions {permissions}");
        Ok(Self {
            backing,
            len,
            permissions,
        })
    }

    /// Returns the size of the block in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block is zero-sized (never true for a constructed `Vmo`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The access rights every mapping of this block carries.
    #[must_use]
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Copies `buf` into the backing storage at `offset`.
    ///
    /// This writes the storage itself, not a mapping, so it works regardless
    /// of the block's declared permissions. This is how read-only (ROM-style)
    /// blocks get their contents. The bytes are visible through every current
    /// and future mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `offset + buf.len()` exceeds the
    /// block, and [`Error::Host`] on I/O failure.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_io(offset, buf.len())?;
        self.backing.write_at(offset, buf)?;
        Ok(())
    }

    /// Copies `buf.len()` bytes out of the backing storage at `offset`.
    ///
    /// Like [`Vmo::write_at`], this bypasses mapping permissions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `offset + buf.len()` exceeds the
    /// block, and [`Error::Host`] on I/O failure.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_io(offset, buf.len())?;
        self.backing.read_at(offset, buf)?;
        Ok(())
    }

    pub(crate) fn backing(&self) -> &sys::Backing {
        &self.backing
    }

    fn check_io(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > self.len {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }
}
