//! These tests take real protection faults: the volatile accesses below hit
//! reserved pages, bounce through SIGSEGV, and come back with handler-made
//! values in the right registers.

use std::ptr;
use std::sync::{Arc, Mutex};

use fastmem::{
    AccessHandler, AccessWidth, AddressSpace, Error, Permissions, Vmo, host_page_size,
};

/// Width-keyed read values and write capture, matching the classic
/// register-block smoke test.
#[derive(Default)]
struct Mmio {
    writes: Mutex<Vec<(usize, usize, u64)>>,
}

impl AccessHandler for Mmio {
    fn read(&self, _offset: usize, width: AccessWidth) -> u64 {
        match width {
            AccessWidth::U8 => 12,
            AccessWidth::U16 => 1234,
            AccessWidth::U32 => 12_345_678,
            AccessWidth::U64 => 1_234_567_890_123_456,
        }
    }

    fn write(&self, offset: usize, width: AccessWidth, value: u64) {
        self.writes
            .lock()
            .unwrap()
            .push((offset, width.bytes(), value));
    }
}

/// Reads echo back the faulting offset so tests can tell registrations apart.
struct EchoOffset;

impl AccessHandler for EchoOffset {
    fn read(&self, offset: usize, _width: AccessWidth) -> u64 {
        offset as u64
    }

    fn write(&self, _offset: usize, _width: AccessWidth, _value: u64) {}
}

#[test]
fn handler_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let page = host_page_size();
    let mut mem = AddressSpace::new(4 * page).unwrap();

    let mmio = Arc::new(Mmio::default());
    mem.add_unmapped_access_handlers(2 * page..3 * page - 1, mmio.clone())
        .unwrap();

    // Safety: every access below lands in the handled interval; the fault
    // path synthesizes the values
    unsafe {
        let p = mem.base_ptr().add(2 * page);
        assert_eq!(ptr::read_volatile(p), 12u8);
        assert_eq!(ptr::read_volatile(p.add(3).cast::<u16>()), 1234);
        assert_eq!(ptr::read_volatile(p.add(5).cast::<u32>()), 12_345_678);
        assert_eq!(ptr::read_volatile(p.add(7).cast::<u64>()), 1_234_567_890_123_456);

        ptr::write_volatile(p.add(2).cast::<u16>(), 4321u16);
    }

    let writes = mmio.writes.lock().unwrap();
    assert_eq!(&*writes, &[(2 * page + 2, 2, 4321)]);
}

#[test]
fn write_capture_all_widths() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(4 * page).unwrap();

    let mmio = Arc::new(Mmio::default());
    mem.add_unmapped_access_handlers(page..2 * page, mmio.clone())
        .unwrap();

    // Safety: all accesses land in the handled interval
    unsafe {
        let p = mem.base_ptr().add(page);
        ptr::write_volatile(p, 21u8);
        ptr::write_volatile(p.add(2).cast::<u16>(), 4321u16);
        ptr::write_volatile(p.add(4).cast::<u32>(), 87_654_321u32);
        ptr::write_volatile(p.add(8).cast::<u64>(), 54_321u64);
        ptr::write_volatile(p.add(16).cast::<u64>(), 6_543_210_987_654_321u64);
    }

    let writes = mmio.writes.lock().unwrap();
    assert_eq!(
        &*writes,
        &[
            (page, 1, 21),
            (page + 2, 2, 4321),
            (page + 4, 4, 87_654_321),
            (page + 8, 8, 54_321),
            (page + 16, 8, 6_543_210_987_654_321),
        ]
    );
}

#[test]
fn read_values_flow_into_computation() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(2 * page).unwrap();

    mem.add_unmapped_access_handlers(0..page, Arc::new(EchoOffset))
        .unwrap();

    // Safety: accesses land in the handled interval
    let (a, b) = unsafe {
        let p = mem.base_ptr();
        let a = ptr::read_volatile(p.add(0x10).cast::<u64>());
        let b = ptr::read_volatile(p.add(0x20).cast::<u64>());
        (a, b)
    };
    // the emulated values behave like ordinary loaded data
    assert_eq!(a + b, 0x30);
    assert_eq!(a * 2, b);
}

#[test]
fn straddling_access_routes_by_start_address() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(2 * page).unwrap();

    let mmio = Arc::new(Mmio::default());
    // the interval ends mid-page; an 8-byte access starting just inside
    // extends past the end and is still routed with its full width
    mem.add_unmapped_access_handlers(0..page / 2, mmio.clone())
        .unwrap();

    // Safety: the access starts inside the handled interval
    unsafe {
        let p = mem.base_ptr().add(page / 2 - 2);
        assert_eq!(ptr::read_volatile(p.cast::<u64>()), 1_234_567_890_123_456);
        ptr::write_volatile(p.cast::<u64>(), 99u64);
    }

    let writes = mmio.writes.lock().unwrap();
    assert_eq!(&*writes, &[(page / 2 - 2, 8, 99)]);
}

#[test]
fn registration_preconditions() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(4 * page).unwrap();

    mem.add_unmapped_access_handlers(page..2 * page, Arc::new(EchoOffset))
        .unwrap();

    // overlap with an existing registration, from every side
    for range in [page..2 * page, 0..page + 1, 2 * page - 1..3 * page] {
        assert!(matches!(
            mem.add_unmapped_access_handlers(range, Arc::new(EchoOffset)),
            Err(Error::OverlappingRegistration)
        ));
    }

    // degenerate and out-of-range intervals
    assert!(matches!(
        mem.add_unmapped_access_handlers(page..page, Arc::new(EchoOffset)),
        Err(Error::OutOfBounds)
    ));
    assert!(matches!(
        mem.add_unmapped_access_handlers(3 * page..5 * page, Arc::new(EchoOffset)),
        Err(Error::OutOfBounds)
    ));

    // an interval holding an active mapping cannot be handled in software
    let ram = Arc::new(Vmo::new(page, Permissions::READ | Permissions::WRITE).unwrap());
    mem.map(&ram, 2 * page).unwrap();
    assert!(matches!(
        mem.add_unmapped_access_handlers(2 * page..3 * page, Arc::new(EchoOffset)),
        Err(Error::AlreadyMapped)
    ));
}

#[test]
fn unmap_restores_protection() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(page).unwrap();
    let ram = Arc::new(Vmo::new(page, Permissions::READ | Permissions::WRITE).unwrap());

    let mapping = mem.map(&ram, 0).unwrap();
    // Safety: mapping is live and read-write
    unsafe {
        ptr::write_volatile(mapping.as_mut_ptr(), 0x77u8);
        assert_eq!(ptr::read_volatile(mapping.as_ptr()), 0x77u8);
    }
    assert!(mem.unmap(&mapping));

    // the range no longer resolves as plain memory: the same address now
    // takes the fault path into a freshly registered handler
    mem.add_unmapped_access_handlers(0..page, Arc::new(EchoOffset))
        .unwrap();
    // Safety: the access lands in the handled interval
    unsafe {
        assert_eq!(ptr::read_volatile(mem.base_ptr().add(0x40).cast::<u64>()), 0x40);
    }
}

#[test]
fn remove_then_reregister() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(page).unwrap();

    let mmio = Arc::new(Mmio::default());
    mem.add_unmapped_access_handlers(0..page, mmio.clone())
        .unwrap();

    assert!(mem.remove_unmapped_access_handlers(0..page));
    assert!(!mem.remove_unmapped_access_handlers(0..page));

    // the interval is free for a different handler, which now owns the range
    mem.add_unmapped_access_handlers(0..page, Arc::new(EchoOffset))
        .unwrap();
    // Safety: the access lands in the handled interval
    unsafe {
        assert_eq!(ptr::read_volatile(mem.base_ptr().add(0x08).cast::<u64>()), 0x08);
    }
    assert!(mmio.writes.lock().unwrap().is_empty());
}

#[test]
fn faults_are_handled_on_any_thread() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(page).unwrap();

    let mmio = Arc::new(Mmio::default());
    mem.add_unmapped_access_handlers(0..page, mmio.clone())
        .unwrap();

    let base = mem.base_ptr() as usize;
    let worker = std::thread::spawn(move || {
        // Safety: the access lands in the handled interval; the space
        // outlives the join below
        unsafe { ptr::write_volatile((base + 0x30) as *mut u32, 0xdead_beef) }
    });
    worker.join().unwrap();

    let writes = mmio.writes.lock().unwrap();
    assert_eq!(&*writes, &[(0x30, 4, 0xdead_beef)]);
}

#[test]
fn handlers_die_with_their_address_space() {
    let page = host_page_size();
    let mmio = Arc::new(Mmio::default());

    {
        let mut mem = AddressSpace::new(page).unwrap();
        mem.add_unmapped_access_handlers(0..page, mmio.clone())
            .unwrap();
    }

    // the space is gone; only our clone of the handler remains
    assert_eq!(Arc::strong_count(&mmio), 1);
}
