//! Fork and copy-on-write.
mod common;

use common::*;
use keos::{KernelError, fs::MemFs};
use keos_vm::page::VmType;

#[test]
fn cow() {
    let vm = vm(8);
    let mut parent = vm.new_process("parent");
    parent.alloc_page(VmType::Anon, BASE, true).unwrap();
    parent.write_user(BASE, b"parent").unwrap();

    let mut child = parent.fork("child").unwrap();
    assert_eq!(parent.frame_refcount(BASE), 2);
    assert_eq!(child.frame_refcount(BASE), 2);
    assert!(parent.is_write_protected(BASE));
    assert!(child.is_write_protected(BASE));
    assert_eq!(vm.stats().resident_frames, 1, "Fork must not copy frames.");

    child.write_user(BASE, b"child!").unwrap();
    assert_eq!(parent.frame_refcount(BASE), 1);
    assert_eq!(child.frame_refcount(BASE), 1);
    assert!(!child.is_write_protected(BASE));
    assert!(
        !parent.is_write_protected(BASE),
        "The last sharer must be writable again."
    );

    let mut buf = [0; 6];
    parent.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"parent", "Child write must not leak into the parent.");
    child.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"child!");
    assert_eq!(vm.stats().resident_frames, 2);
}

#[test]
fn cow_perm() {
    let vm = vm(8);
    let mut parent = vm.new_process("parent");
    parent.alloc_page(VmType::Anon, BASE, false).unwrap();
    parent.read_user(BASE, &mut [0; 1]).unwrap();
    let mut child = parent.fork("child").unwrap();
    assert!(
        !child.is_write_protected(BASE),
        "Read-only pages are not copy-on-write."
    );
    assert_eq!(child.write_user(BASE, &[1]), Err(KernelError::BadAddress));
    assert_eq!(child.exit_status(), Some(-1));
    assert_eq!(parent.frame_refcount(BASE), 1);
}

#[test]
fn cow_sys() {
    let vm = vm(8);
    let mut parent = vm.new_process("parent");
    parent.setup_stack().unwrap();
    parent.alloc_page(VmType::Anon, BASE, true).unwrap();
    parent.write_user(BASE, b"shared").unwrap();
    let mut child = parent.fork("child").unwrap();
    // The kernel writes into the shared page on behalf of a system call.
    child.copy_to_user(BASE, b"kernel").unwrap();
    let mut buf = [0; 6];
    parent.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");
    child.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"kernel");
}

#[test]
fn cow_parent_exits_first() {
    let vm = vm(8);
    let mut parent = vm.new_process("parent");
    parent.alloc_page(VmType::Anon, BASE, true).unwrap();
    parent.write_user(BASE, b"data").unwrap();
    let mut child = parent.fork("child").unwrap();
    parent.exit(0);
    assert_eq!(child.frame_refcount(BASE), 1);
    assert!(!child.is_write_protected(BASE));
    child.write_user(BASE, b"mine").unwrap();
    assert_eq!(vm.stats().resident_frames, 1, "No copy for the sole sharer.");
}

#[test]
fn fork_shares_swapped_pages() {
    let (vm, _probe) = vm_with_probe(2, 16);
    let mut parent = vm.new_process("parent");
    for i in 0..4 {
        parent.alloc_page(VmType::Anon, BASE + i * PAGE, true).unwrap();
        parent.write_user(BASE + i * PAGE, &pattern(i)).unwrap();
    }
    // Two of the pages are in swap now.
    let mut child = parent.fork("child").unwrap();
    let slots_in_use = vm.stats().swap_slots - vm.stats().free_swap_slots;
    assert_eq!(slots_in_use, 2, "Fork must share swap slots, not copy them.");

    child.write_user(BASE, b"child").unwrap();
    for i in 0..4 {
        let mut buf = vec![0; PAGE];
        parent.read_user(BASE + i * PAGE, &mut buf).unwrap();
        assert_eq!(buf, pattern(i), "Parent page {} must be intact.", i);
    }
    let mut buf = [0; 5];
    child.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"child");

    drop(parent);
    drop(child);
    let stats = vm.stats();
    assert_eq!(stats.free_swap_slots, stats.swap_slots);
    assert_eq!(stats.free_frames, 2);
}

#[test]
fn fork_copies_uninit_and_mmap() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("data", &[7; 5000]).unwrap();
    let mut parent = vm.new_process("parent");
    parent.alloc_page(VmType::Anon, BASE, true).unwrap();
    let map = parent.mmap(BASE + 16 * PAGE, 5000, true, &file, 0).unwrap();

    let mut child = parent.fork("child").unwrap();
    assert_eq!(child.spt().len(), 3);
    assert_eq!(child.mmaps().count(), 1);
    let mut buf = [0; 4];
    child.read_user(map.into_usize() + PAGE, &mut buf).unwrap();
    assert_eq!(buf, [7; 4]);
    child.munmap(map).unwrap();
    assert!(parent.munmap(map).is_ok(), "Parent mapping must survive.");
}

#[test]
fn cow_cleanup_stress() {
    let (vm, _probe) = vm_with_probe(4, 64);
    for round in 0..12 {
        let mut parent = vm.new_process("parent");
        parent.setup_stack().unwrap();
        for i in 0..6 {
            parent.alloc_page(VmType::Anon, BASE + i * PAGE, true).unwrap();
            parent.write_user(BASE + i * PAGE, &[round as u8; 8]).unwrap();
        }
        let mut child = parent.fork("child").unwrap();
        for i in (0..6).step_by(2) {
            child.write_user(BASE + i * PAGE, &[0xee; 8]).unwrap();
        }
        child.exit(0);
        parent.exit(0);
    }
    let stats = vm.stats();
    assert_eq!(stats.resident_frames, 0);
    assert_eq!(stats.free_frames, 4);
    assert_eq!(stats.free_swap_slots, stats.swap_slots);
}

#[test]
fn mmap_fork_munmap_writes_back() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("shared", &[b'.'; 100]).unwrap();
    let mut parent = vm.new_process("parent");
    let map = parent.mmap(BASE, 100, true, &file, 0).unwrap();
    parent.write_user(BASE, b"A").unwrap();
    let mut child = parent.fork("child").unwrap();
    assert_eq!(parent.frame_refcount(BASE), 2);

    parent.munmap(map).unwrap();
    let mut data = [0; 1];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"A", "munmap() must write back a dirty shared page");

    let mut buf = [0; 1];
    child.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"A");
    child.exit(0);
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"A");
}

#[test]
fn mmap_cow_keeps_newer_data() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("shared", &[b'.'; 100]).unwrap();
    let mut parent = vm.new_process("parent");
    let map = parent.mmap(BASE, 100, true, &file, 0).unwrap();
    parent.write_user(BASE, b"A").unwrap();
    let mut child = parent.fork("child").unwrap();
    parent.write_user(BASE, b"B").unwrap();
    parent.munmap(map).unwrap();
    let mut data = [0; 1];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"B");

    let mut buf = [0; 1];
    child.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"A", "The child still sees the page from fork time.");
    child.exit(0);
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"B", "A sharer that never wrote must not write back.");
}

#[test]
fn mmap_clean_sharer_eviction_keeps_file() {
    let vm = vm(2);
    let fs = MemFs::new();
    let file = fs.create("shared", &[b'.'; 100]).unwrap();
    let mut parent = vm.new_process("parent");
    let map = parent.mmap(BASE, 100, true, &file, 0).unwrap();
    parent.write_user(BASE, b"A").unwrap();
    let mut child = parent.fork("child").unwrap();
    parent.write_user(BASE, b"B").unwrap();
    parent.munmap(map).unwrap();

    // Push the child's copy of the file page out of memory.
    for i in 1..4 {
        child.alloc_page(VmType::Anon, BASE + i * PAGE, true).unwrap();
        child.write_user(BASE + i * PAGE, &[i as u8]).unwrap();
    }
    assert!(!child.is_resident(BASE));
    let mut data = [0; 1];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"B", "Evicting a clean sharer must not write back.");
}
