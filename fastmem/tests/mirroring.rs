use std::sync::Arc;

use fastmem::{AddressSpace, Error, Permissions, Vmo, host_page_size};

fn rw() -> Permissions {
    Permissions::READ | Permissions::WRITE
}

#[test]
fn mirrored_mappings_share_storage() {
    let _ = env_logger::builder().is_test(true).try_init();

    let page = host_page_size();
    let mut mem = AddressSpace::new(3 * page).unwrap();
    let ram = Arc::new(Vmo::new(page, rw()).unwrap());

    let main = mem.map(&ram, 0).unwrap();
    let mirror = mem.map(&ram, page).unwrap();

    // Safety: both mappings are live and read-write; the test is single
    // threaded so there are no concurrent writers
    unsafe {
        main.slice_mut()[0] = 0x15;
        main.slice_mut()[1] = 0x33;
        assert_eq!(mirror.slice()[0], 0x15);
        assert_eq!(mirror.slice()[1], 0x33);

        mirror.slice_mut()[2] = 0x64;
        assert_eq!(main.slice()[2], 0x64);

        // the same bytes are visible through the reservation's own pointer
        assert_eq!(mem.slice(0..page)[2], 0x64);
        assert_eq!(mem.slice(page..2 * page)[0], 0x15);
    }

    // and through direct I/O on the block itself
    let mut byte = [0u8; 1];
    ram.read_at(2, &mut byte).unwrap();
    assert_eq!(byte[0], 0x64);
}

#[test]
fn mirror_reflects_every_byte() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(2 * page).unwrap();
    let ram = Arc::new(Vmo::new(page, rw()).unwrap());

    let main = mem.map(&ram, 0).unwrap();
    let mirror = mem.map(&ram, page).unwrap();

    // Safety: as above
    unsafe {
        for (i, byte) in main.slice_mut().iter_mut().enumerate() {
            *byte = (i * 31) as u8;
        }
        for (i, byte) in mirror.slice().iter().enumerate() {
            assert_eq!(*byte, (i * 31) as u8);
        }

        // and the reverse direction
        for byte in mirror.slice_mut().iter_mut() {
            *byte = !*byte;
        }
        for (i, byte) in main.slice().iter().enumerate() {
            assert_eq!(*byte, !((i * 31) as u8));
        }
    }
}

#[test]
fn blocks_mirror_across_address_spaces() {
    let page = host_page_size();
    let mut left = AddressSpace::new(page).unwrap();
    let mut right = AddressSpace::new(page).unwrap();
    let shared = Arc::new(Vmo::new(page, rw()).unwrap());

    let in_left = left.map(&shared, 0).unwrap();
    let in_right = right.map(&shared, 0).unwrap();

    // Safety: both mappings live, single threaded
    unsafe {
        in_left.slice_mut()[7] = 0x2a;
        assert_eq!(in_right.slice()[7], 0x2a);
    }
}

#[test]
fn map_preconditions() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(4 * page).unwrap();
    let ram = Arc::new(Vmo::new(2 * page, rw()).unwrap());

    assert!(matches!(mem.map(&ram, 1), Err(Error::UnalignedOffset)));
    assert!(matches!(mem.map(&ram, 3 * page), Err(Error::OutOfBounds)));

    let mapping = mem.map(&ram, 0).unwrap();
    assert_eq!(mapping.offset(), 0);
    assert_eq!(mapping.len(), 2 * page);

    // every flavor of intersection with the live mapping is rejected
    assert!(matches!(mem.map(&ram, 0), Err(Error::AlreadyMapped)));
    assert!(matches!(mem.map(&ram, page), Err(Error::AlreadyMapped)));

    // an adjacent placement is not an overlap
    let other = Arc::new(Vmo::new(page, rw()).unwrap());
    assert!(mem.map(&other, 2 * page).is_ok());
}

#[test]
fn vmo_preconditions() {
    let page = host_page_size();
    assert!(matches!(Vmo::new(0, rw()), Err(Error::UnalignedSize)));
    assert!(matches!(Vmo::new(page + 1, rw()), Err(Error::UnalignedSize)));

    let vmo = Vmo::new(page, rw()).unwrap();
    assert_eq!(vmo.len(), page);
    assert!(matches!(
        vmo.write_at(page - 1, &[0, 0]),
        Err(Error::OutOfBounds)
    ));
    let mut buf = [0u8; 2];
    assert!(matches!(
        vmo.read_at(page - 1, &mut buf),
        Err(Error::OutOfBounds)
    ));
}

#[test]
fn reservation_rounds_up_to_page_granularity() {
    let page = host_page_size();
    let mem = AddressSpace::new(page + 1).unwrap();
    assert_eq!(mem.len(), 2 * page);
    assert!(!mem.base_ptr().is_null());

    assert!(matches!(AddressSpace::new(0), Err(Error::OutOfBounds)));
}

#[test]
fn unmap_is_idempotent() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(2 * page).unwrap();
    let ram = Arc::new(Vmo::new(page, rw()).unwrap());

    let mapping = mem.map(&ram, page).unwrap();
    assert!(mem.unmap(&mapping));
    assert!(!mem.unmap(&mapping));
    assert!(!mem.unmap(&mapping));

    // the range is free again
    let again = mem.map(&ram, page).unwrap();
    assert!(mem.unmap(&again));
}

#[test]
fn read_only_blocks_hold_their_contents() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(page).unwrap();

    let rom = Arc::new(Vmo::new(page, Permissions::READ).unwrap());
    let image: Vec<u8> = (0..page).map(|i| (i ^ (i >> 8)) as u8).collect();
    rom.write_at(0, &image).unwrap();

    let mapping = mem.map(&rom, 0).unwrap();
    // Safety: mapping is live and readable, single threaded
    unsafe {
        assert_eq!(mapping.slice(), &image[..]);
    }

    // contents written after mapping show through as well
    rom.write_at(3, &[0xaa]).unwrap();
    // Safety: as above
    unsafe {
        assert_eq!(mapping.slice()[3], 0xaa);
    }
}

#[test]
fn block_outlives_its_mappings() {
    let page = host_page_size();
    let mut mem = AddressSpace::new(page).unwrap();

    let mapping = {
        // the only external Arc to the block is dropped here; the mapping's
        // clone keeps the storage alive
        let ram = Arc::new(Vmo::new(page, rw()).unwrap());
        mem.map(&ram, 0).unwrap()
    };

    // Safety: mapping is live and read-write, single threaded
    unsafe {
        mapping.slice_mut()[0] = 0x5a;
        assert_eq!(mapping.slice()[0], 0x5a);
    }
}
