//! A toy console bus: ROM, RAM with a mirror, an MMIO register block, and an
//! open-bus region, all living in one reserved guest address space.
//!
//! Layout (in pages):
//!
//! ```text
//! region     page   backing
//! ROM        0      read-only block, contents loaded via write_at
//! RAM        1      read-write block
//! RAM mirror 2      the same block again
//! MMIO       3      access handlers (reads synthesized, writes logged)
//! ```

use std::ptr;
use std::sync::Arc;

use fastmem::{
    AccessHandler, AccessWidth, AddressSpace, Permissions, Vmo, host_page_size,
};

/// A little register block: reads return a width-tagged constant, writes are
/// printed like a bus analyzer would.
struct Registers;

impl AccessHandler for Registers {
    fn read(&self, offset: usize, width: AccessWidth) -> u64 {
        let value = match width {
            AccessWidth::U8 => 12,
            AccessWidth::U16 => 1234,
            AccessWidth::U32 => 12_345_678,
            AccessWidth::U64 => 1_234_567_890_123_456,
        };
        println!("mmio read  {:>2} bytes at +{offset:#06x} -> {value}", width.bytes());
        value
    }

    fn write(&self, offset: usize, width: AccessWidth, value: u64) {
        println!("mmio write {:>2} bytes at +{offset:#06x} <- {value}", width.bytes());
    }
}

fn main() {
    env_logger::init();

    let page = host_page_size();
    let mut bus = AddressSpace::new(4 * page).expect("reserve guest address space");
    println!("guest address space: {:#x} bytes at {:p}", bus.len(), bus.base_ptr());

    // ROM: permissions forbid writes through the mapping, contents go in
    // through the backing object
    let rom = Arc::new(Vmo::new(page, Permissions::READ).expect("allocate ROM"));
    let image: Vec<u8> = (0..page).map(|i| (i % 251) as u8).collect();
    rom.write_at(0, &image).expect("load ROM image");
    bus.map(&rom, 0).expect("map ROM");

    // RAM, mapped twice: the classic cheap mirror
    let ram = Arc::new(Vmo::new(page, Permissions::READ | Permissions::WRITE).expect("allocate RAM"));
    let ram_main = bus.map(&ram, page).expect("map RAM");
    let ram_mirror = bus.map(&ram, 2 * page).expect("map RAM mirror");

    // MMIO: a reserved page routed to software
    bus.add_unmapped_access_handlers(3 * page..4 * page, Arc::new(Registers))
        .expect("register MMIO handlers");

    // Safety: all accesses below go through live mappings or the handled
    // MMIO page of this single-threaded demo
    unsafe {
        println!("rom[16]  = {}", bus.slice(0..page)[16]);

        ram_main.slice_mut()[0] = 0x15;
        ram_mirror.slice_mut()[1] = 0x33;
        println!("ram[0]   = {:#04x} (written through main)", ram_mirror.slice()[0]);
        println!("ram[1]   = {:#04x} (written through mirror)", ram_main.slice()[1]);

        let mmio = bus.base_ptr().add(3 * page);
        ptr::write_volatile(mmio, 21u8);
        ptr::write_volatile(mmio.add(2).cast::<u16>(), 4321u16);
        let v8 = ptr::read_volatile(mmio.add(1));
        let v32 = ptr::read_volatile(mmio.add(4).cast::<u32>());
        println!("mmio reads gave {v8} and {v32}");
    }
}
