/// Width in bytes of an emulated memory access.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum AccessWidth {
    /// A 1-byte access
    U8,
    /// A 2-byte access
    U16,
    /// A 4-byte access
    U32,
    /// An 8-byte access
    U64,
}

impl AccessWidth {
    /// The width in bytes: 1, 2, 4, or 8.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::U8 => 1,
            AccessWidth::U16 => 2,
            AccessWidth::U32 => 4,
            AccessWidth::U64 => 8,
        }
    }

    /// Mask covering the low `bytes()` bytes of a value.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            AccessWidth::U8 => 0xff,
            AccessWidth::U16 => 0xffff,
            AccessWidth::U32 => 0xffff_ffff,
            AccessWidth::U64 => u64::MAX,
        }
    }
}

/// Software emulation of accesses to an unmapped interval.
///
/// Registered with [`AddressSpace::add_unmapped_access_handlers`] for a range
/// of reservation-relative offsets. What the original machine would have wired
/// up as device state lives in the implementor; there is no separate context
/// pointer.
///
/// Both callbacks execute on the faulting thread, inside the protection-fault
/// handler, with the faulting instruction suspended. They must not touch
/// unmapped reservation memory themselves (that fault would be fatal), must
/// not block indefinitely, and should avoid allocation.
///
/// `offset` is relative to the owning reservation's base. An access that
/// starts inside the registered interval is routed here with its full width,
/// even if it extends past the interval's end.
///
/// [`AddressSpace::add_unmapped_access_handlers`]: crate::AddressSpace::add_unmapped_access_handlers
pub trait AccessHandler: Send + Sync {
    /// Produce the value an emulated read of `width` at `offset` observes.
    ///
    /// Only the low `width.bytes()` bytes of the returned value are used.
    fn read(&self, offset: usize, width: AccessWidth) -> u64;

    /// Consume the value an emulated write of `width` at `offset` stores.
    ///
    /// `value` is masked to `width.bytes()` bytes; the store never reaches
    /// real memory.
    fn write(&self, offset: usize, width: AccessWidth, value: u64);
}
