use core::fmt;
use std::io;

/// Errors returned by address space, backing memory, and registration
/// operations.
///
/// All of these are configuration-time conditions and recoverable; probing for
/// free space by attempting a map is a legitimate caller pattern. Fault-time
/// conditions never surface as values: a fault nobody owns is re-raised to the
/// previously installed handler, and an owned fault with no registration
/// terminates the process.
#[derive(Debug)]
pub enum Error {
    /// The host could not reserve the requested amount of address space.
    OutOfAddressSpace,
    /// A backing block size is zero or not a multiple of the page size.
    UnalignedSize,
    /// A mapping offset is not page aligned.
    UnalignedOffset,
    /// A range extends past the end of the reservation, or is empty.
    OutOfBounds,
    /// The requested range intersects an active mapping.
    AlreadyMapped,
    /// The requested interval intersects an existing handler registration.
    OverlappingRegistration,
    /// The host rejected a memory-management operation.
    Host(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfAddressSpace => f.write_str("address space reservation failed"),
            Error::UnalignedSize => {
                f.write_str("backing size must be a non-zero multiple of the page size")
            }
            Error::UnalignedOffset => f.write_str("mapping offset must be page aligned"),
            Error::OutOfBounds => f.write_str("range must be non-empty and inside the reservation"),
            Error::AlreadyMapped => f.write_str("requested range intersects an active mapping"),
            Error::OverlappingRegistration => {
                f.write_str("requested interval intersects an existing registration")
            }
            Error::Host(err) => write!(f, "host memory operation failed: {err}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Host(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Host(err)
    }
}
