//! Host-specific virtual memory and fault notification primitives.
//!
//! Everything the rest of the crate needs from the host funnels through this
//! module: reserving address space, creating shareable backing objects,
//! placing and removing aliases, and installing the synchronous fault
//! notifier with access to the trapped register context. One backend per
//! host keeps everything above this line host-agnostic.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod unix;
        pub(crate) use unix::*;
    } else {
        compile_error!(
            "fastmem needs a Linux host: page aliasing uses memfd and fault \
             interception uses SIGSEGV with ucontext register access"
        );
    }
}
