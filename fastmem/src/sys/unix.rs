//! Linux backend: mmap/memfd page plumbing and SIGSEGV interception.
//!
//! Reservations are `PROT_NONE` anonymous mappings; backing blocks are
//! memfds, which is what makes one block mappable at several places at once;
//! placing a block is a `MAP_FIXED` shared mapping of the memfd over the
//! placeholder pages, and removing one puts the placeholder back.
//!
//! The fault side registers a SIGSEGV action (saving whatever was installed
//! before) and hands each fault to [`trap::dispatch`]. Faults that are not
//! ours are forwarded to the saved action exactly as the kernel would have
//! delivered them; faults that are ours but unemulatable terminate via the
//! only async-signal-safe route available (`write` + `abort`).

use core::ffi::c_void;
use core::mem::{self, MaybeUninit};
use core::ptr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::trap::{self, Disposition};
use crate::{Error, Permissions, Result};

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // Safety: sysconf has no memory-safety preconditions
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

// =============================================================================
// Reservation
// =============================================================================

/// An owned `PROT_NONE` address range. Dropping it unmaps the whole range,
/// including any aliases still placed inside.
#[derive(Debug)]
pub(crate) struct Reservation {
    base: usize,
    len: usize,
}

impl Reservation {
    pub(crate) fn reserve(len: usize) -> Result<Self> {
        // Safety: requesting a fresh mapping at a kernel-chosen address
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::OutOfAddressSpace);
        }
        Ok(Self {
            base: base as usize,
            len,
        })
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Safety: we own [base, base + len) since reserve
        unsafe { libc::munmap(self.base as *mut c_void, self.len) };
    }
}

// =============================================================================
// Backing
// =============================================================================

/// A shareable backing allocation (memfd). The fd is the identity every
/// alias maps; pread/pwrite on it reach the storage regardless of any
/// mapping's protection.
#[derive(Debug)]
pub(crate) struct Backing {
    fd: OwnedFd,
}

impl Backing {
    pub(crate) fn new(len: usize) -> Result<Self> {
        // Safety: static NUL-terminated name, no other preconditions
        let raw = unsafe { libc::memfd_create(c"fastmem-backing".as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Safety: raw is a freshly created descriptor we own
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // Safety: sizing our own memfd
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    pub(crate) fn write_at(&self, mut offset: usize, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // Safety: writing from a live borrow; the caller bounds-checked offset
            let n = unsafe {
                libc::pwrite(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            match n {
                n if n < 0 => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n as usize..];
                    offset += n as usize;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read_at(&self, mut offset: usize, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // Safety: reading into a live unique borrow; offset bounds-checked by caller
            let n = unsafe {
                libc::pread(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            match n {
                n if n < 0 => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    buf = &mut mem::take(&mut buf)[n as usize..];
                    offset += n as usize;
                }
            }
        }
        Ok(())
    }
}

/// Places `backing` at `addr`, replacing the placeholder pages there.
pub(crate) fn map_backing(
    addr: usize,
    len: usize,
    backing: &Backing,
    permissions: Permissions,
) -> Result<()> {
    // Safety: addr is inside a reservation the caller owns; MAP_FIXED
    // replaces those pages atomically
    let mapped = unsafe {
        libc::mmap(
            addr as *mut c_void,
            len,
            prot(permissions),
            libc::MAP_SHARED | libc::MAP_FIXED,
            backing.fd.as_raw_fd(),
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Reinstates no-access placeholder pages over `[addr, addr + len)`.
pub(crate) fn protect_none(addr: usize, len: usize) -> Result<()> {
    // Safety: addr is inside a reservation the caller owns
    let mapped = unsafe {
        libc::mmap(
            addr as *mut c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn prot(permissions: Permissions) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if permissions.contains(Permissions::READ) {
        prot |= libc::PROT_READ;
    }
    if permissions.contains(Permissions::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    prot
}

// =============================================================================
// Fault notification
// =============================================================================

static mut PREV_SIGSEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Installs the SIGSEGV action, saving the previous one for chaining and
/// restoration.
///
/// # Safety
///
/// Calls must be serialized with [`restore_fault_handler`] (the interceptor's
/// refcount lock does this) and paired with it.
pub(crate) unsafe fn install_fault_handler() -> Result<()> {
    // Safety: zeroed sigaction is a valid starting point; PREV_SIGSEGV is
    // only touched under the caller's serialization
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        // SA_SIGINFO for the faulting address, SA_ONSTACK to keep working
        // after a guest stack overflow via Rust's sigaltstack, SA_NODEFER so
        // a crash inside the handler reaches the previous handler instead of
        // wedging the thread.
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        action.sa_sigaction = fault_trampoline as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(
            libc::SIGSEGV,
            &action,
            (&raw mut PREV_SIGSEGV).cast::<libc::sigaction>(),
        ) != 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Puts the previously installed SIGSEGV action back.
///
/// # Safety
///
/// Must follow a successful [`install_fault_handler`], serialized the same
/// way.
pub(crate) unsafe fn restore_fault_handler() {
    // Safety: PREV_SIGSEGV was initialized by install_fault_handler
    unsafe {
        libc::sigaction(
            libc::SIGSEGV,
            (&raw const PREV_SIGSEGV).cast::<libc::sigaction>(),
            ptr::null_mut(),
        );
    }
}

unsafe extern "C" fn fault_trampoline(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    // Safety: the kernel delivers a valid siginfo and ucontext for the
    // duration of the handler
    let disposition = unsafe {
        let fault_addr = (*siginfo).si_addr() as usize;
        let mut ctx = TrapContext::from_raw(context.cast::<libc::ucontext_t>());
        trap::dispatch(fault_addr, &mut ctx)
    };

    match disposition {
        Disposition::Resumed => {}
        Disposition::Fatal(msg) => fatal(msg),
        // Safety: forwarding to the action saved at install time
        Disposition::Foreign => unsafe { chain_previous(signum, siginfo, context) },
    }
}

/// Re-raises a fault that is not ours to whatever was installed before us,
/// preserving its exact semantics.
unsafe fn chain_previous(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    // Safety: PREV_SIGSEGV was written by install_fault_handler before this
    // handler could run
    unsafe {
        let previous = (&raw const PREV_SIGSEGV).read().assume_init();
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            mem::transmute::<usize, extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)>(
                previous.sa_sigaction,
            )(signum, siginfo, context);
        } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
            // reinstate the previous disposition and return; the faulting
            // instruction re-executes and the default action fires
            libc::sigaction(signum, &previous, ptr::null_mut());
        } else {
            mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(signum);
        }
    }
}

/// Terminate with a message. Only async-signal-safe calls from here on.
fn fatal(msg: &str) -> ! {
    // Safety: write(2) from a live buffer; abort never returns
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::abort();
    }
}

// =============================================================================
// TrapContext
// =============================================================================

/// The trapped register context of a faulting thread, with just enough
/// access to emulate an instruction: program counter read/write and the
/// integer register file by the decoder's numbering.
pub(crate) struct TrapContext {
    uc: *mut libc::ucontext_t,
}

impl TrapContext {
    /// # Safety
    ///
    /// `uc` must be the ucontext delivered to a signal handler, and the
    /// `TrapContext` must not outlive that handler invocation.
    pub(crate) unsafe fn from_raw(uc: *mut libc::ucontext_t) -> Self {
        Self { uc }
    }
}

#[cfg(target_arch = "x86_64")]
impl TrapContext {
    /// Decoder register numbering (RAX..RDI, R8..R15) to glibc `gregs`
    /// indices.
    const GREGS: [i32; 16] = [
        libc::REG_RAX,
        libc::REG_RCX,
        libc::REG_RDX,
        libc::REG_RBX,
        libc::REG_RSP,
        libc::REG_RBP,
        libc::REG_RSI,
        libc::REG_RDI,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
    ];

    pub(crate) fn pc(&self) -> usize {
        // Safety: uc is valid for the handler's duration (from_raw contract)
        unsafe { (*self.uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
    }

    pub(crate) fn set_pc(&mut self, pc: usize) {
        // Safety: as in pc()
        unsafe { (*self.uc).uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64 };
    }

    pub(crate) fn read_reg(&self, reg: u8) -> u64 {
        // Safety: as in pc(); reg is 0..16 by the decoder's contract
        unsafe { (*self.uc).uc_mcontext.gregs[Self::GREGS[reg as usize] as usize] as u64 }
    }

    pub(crate) fn write_reg(&mut self, reg: u8, value: u64) {
        // Safety: as in pc(); reg is 0..16 by the decoder's contract
        unsafe { (*self.uc).uc_mcontext.gregs[Self::GREGS[reg as usize] as usize] = value as i64 };
    }
}

#[cfg(target_arch = "aarch64")]
impl TrapContext {
    pub(crate) fn pc(&self) -> usize {
        // Safety: uc is valid for the handler's duration (from_raw contract)
        unsafe { (*self.uc).uc_mcontext.pc as usize }
    }

    pub(crate) fn set_pc(&mut self, pc: usize) {
        // Safety: as in pc()
        unsafe { (*self.uc).uc_mcontext.pc = pc as u64 };
    }

    /// Register 31 is XZR here: loads and stores never address SP through it.
    pub(crate) fn read_reg(&self, reg: u8) -> u64 {
        if reg == 31 {
            return 0;
        }
        // Safety: as in pc(); reg is 0..31 by the decoder's contract
        unsafe { (*self.uc).uc_mcontext.regs[reg as usize] }
    }

    pub(crate) fn write_reg(&mut self, reg: u8, value: u64) {
        if reg == 31 {
            return;
        }
        // Safety: as in pc(); reg is 0..31 by the decoder's contract
        unsafe { (*self.uc).uc_mcontext.regs[reg as usize] = value };
    }
}
