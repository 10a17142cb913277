//! Memory-mapped files and lazily loaded segments.
mod common;

use common::*;
use keos::{KernelError, addressing::Va, fs::MemFs};
use keos_vm::{USER_STACK_TOP, page::VmType};

#[test]
fn mm_mmap() {
    let vm = vm(8);
    let fs = MemFs::new();
    let contents = pattern(3);
    let file = fs.create("a", &contents).unwrap();
    let mut mm = vm.new_process("mmap");
    let va = mm.mmap(BASE, PAGE, false, &file, 0).unwrap();
    assert_eq!(va.into_usize(), BASE);
    assert!(!mm.is_resident(BASE), "mmap must be lazy.");
    assert_eq!(mm.spt().find(va).map(|p| p.ty()), Some(VmType::File));

    let mut buf = vec![0; PAGE];
    mm.read_user(BASE, &mut buf).unwrap();
    assert_eq!(buf, contents);
}

#[test]
fn mm_mmap_error() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("a", &[1; 100]).unwrap();
    let empty = fs.create("empty", &[]).unwrap();
    let mut mm = vm.new_process("mmap-error");
    mm.setup_stack().unwrap();

    assert_eq!(
        mm.mmap(0, PAGE, true, &file, 0).err(),
        Some(KernelError::InvalidArgument),
        "mmap() to NULL should fail"
    );
    assert_eq!(
        mm.mmap(BASE + 1, PAGE, true, &file, 0).err(),
        Some(KernelError::InvalidArgument),
        "mmap() to an unaligned address should fail"
    );
    assert_eq!(
        mm.mmap(BASE, 0, true, &file, 0).err(),
        Some(KernelError::InvalidArgument),
        "mmap() of zero bytes should fail"
    );
    assert_eq!(
        mm.mmap(BASE, PAGE, true, &file, 10).err(),
        Some(KernelError::InvalidArgument),
        "mmap() with an unaligned offset should fail"
    );
    assert_eq!(
        mm.mmap(BASE, PAGE, true, &empty, 0).err(),
        Some(KernelError::InvalidArgument),
        "mmap() of an empty file should fail"
    );
    assert_eq!(
        mm.mmap(0x7fff_ffff_f000, 2 * PAGE, true, &file, 0).err(),
        Some(KernelError::InvalidArgument),
        "mmap() into the kernel should fail"
    );
    assert_eq!(
        mm.mmap(USER_STACK_TOP - 2 * PAGE, PAGE, true, &file, 0).err(),
        Some(KernelError::FileExist),
        "mmap() over the stack should fail"
    );
    mm.mmap(BASE, 2 * PAGE, true, &file, 0).unwrap();
    assert_eq!(
        mm.mmap(BASE + PAGE, PAGE, true, &file, 0).err(),
        Some(KernelError::FileExist),
        "mmap() over an existing mapping should fail"
    );
    assert_eq!(mm.sys_mmap(0, PAGE, true, &file, 0), 0);
    assert_eq!(mm.mmaps().count(), 1);
}

#[test]
fn mm_mmap_partial_page() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("b", &[0x42; 4100]).unwrap();
    let mut mm = vm.new_process("mmap-4100");
    let va = mm.mmap(BASE, 4100, false, &file, 0).unwrap();
    assert_eq!(mm.spt().len(), 2, "4100 bytes take exactly two pages.");
    assert_eq!(mm.mmaps().next().map(|m| m.pages()), Some(2));

    let mut buf = vec![0xff; PAGE];
    mm.read_user(va.into_usize() + PAGE, &mut buf).unwrap();
    assert!(buf[..4].iter().all(|v| *v == 0x42));
    assert!(buf[4..].iter().all(|v| *v == 0), "Tail must be zero.");
}

#[test]
fn mm_mmap_write_back() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("small", &[b'.'; 100]).unwrap();
    let mut mm = vm.new_process("write-back");
    let va = mm.mmap(BASE, 100, true, &file, 0).unwrap();
    mm.write_user(BASE + 10, b"hello").unwrap();
    // Bytes past the end of the file live only in memory.
    mm.write_user(BASE + 200, b"ghost").unwrap();
    mm.munmap(va).unwrap();

    assert_eq!(file.size(), 100, "Write-back must not extend the file.");
    let mut data = [0; 100];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data[10..15], b"hello");
    assert_eq!(data[0], b'.');
    assert_eq!(data[99], b'.');
    assert!(!mm.is_resident(BASE));
    assert_eq!(mm.spt().len(), 0);
}

#[test]
fn mm_mmap_clean_pages_not_written() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("ro", &[1; 2 * 4096]).unwrap();
    let mut mm = vm.new_process("clean");
    let va = mm.mmap(BASE, 2 * PAGE, true, &file, 0).unwrap();
    mm.read_user(BASE, &mut [0; 8]).unwrap();
    // Change the file behind the mapping; writing the clean page back would
    // revert it.
    file.write(0, b"changed").unwrap();
    mm.munmap(va).unwrap();
    let mut data = [0; 7];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"changed", "Clean pages must not be written back.");
}

#[test]
fn mm_mmap_eviction_writes_back() {
    let vm = vm(1);
    let fs = MemFs::new();
    let file = fs.create("evict", &[0; 2 * 4096]).unwrap();
    let mut mm = vm.new_process("evict");
    mm.mmap(BASE, 2 * PAGE, true, &file, 0).unwrap();
    mm.write_user(BASE, b"first").unwrap();
    // Only one frame: touching the second page evicts the first.
    mm.write_user(BASE + PAGE, b"second").unwrap();
    let mut data = [0; 5];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"first", "Eviction must write dirty pages back.");

    let mut buf = [0; 5];
    mm.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"first");
    let stats = vm.stats();
    assert_eq!(stats.swap_outs, 0, "File pages never go to swap.");
}

#[test]
fn mm_mmap_outlives_handle() {
    let vm = vm(8);
    let fs = MemFs::new();
    let mut mm = vm.new_process("closed");
    {
        let file = fs.create("closed", b"still here").unwrap();
        mm.mmap(BASE, 10, false, &file, 0).unwrap();
    }
    let mut buf = [0; 10];
    mm.read_user(BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"still here");
}

#[test]
fn mm_munmap_error() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("a", &[1; 100]).unwrap();
    let mut mm = vm.new_process("munmap");
    mm.mmap(BASE, PAGE, true, &file, 0).unwrap();
    assert_eq!(
        mm.sys_munmap(BASE + PAGE),
        KernelError::InvalidArgument.into_usize(),
        "munmap() of an unmapped address should fail"
    );
    assert_eq!(mm.sys_munmap(BASE), 0);
    assert_eq!(
        mm.sys_munmap(BASE),
        KernelError::InvalidArgument.into_usize(),
        "munmap() twice should fail"
    );
}

#[test]
fn exit_writes_back() {
    let vm = vm(8);
    let fs = MemFs::new();
    let file = fs.create("exit", &[0; 64]).unwrap();
    let mut mm = vm.new_process("exit");
    mm.mmap(BASE, 64, true, &file, 0).unwrap();
    mm.write_user(BASE, b"bye").unwrap();
    mm.exit(0);
    let mut data = [0; 3];
    file.read(0, &mut data).unwrap();
    assert_eq!(&data, b"bye");
}

#[test]
fn load_segment() {
    let vm = vm(8);
    let fs = MemFs::new();
    let mut image = pattern(1);
    image.extend(pattern(2));
    let exe = fs.create("exe", &image).unwrap();
    let mut mm = vm.new_process("exe");
    // Text: one page read-only. Data: 100 bytes followed by a zeroed page.
    mm.load_segment(&exe, 0, BASE, PAGE, 0, false).unwrap();
    mm.load_segment(&exe, PAGE, BASE + PAGE, 100, 2 * PAGE - 100, true)
        .unwrap();
    assert_eq!(mm.spt().len(), 3);
    assert_eq!(mm.spt().iter().filter(|p| p.is_uninit()).count(), 3);

    let mut buf = vec![0; PAGE];
    mm.read_user(BASE, &mut buf).unwrap();
    assert_eq!(buf, pattern(1));
    mm.read_user(BASE + PAGE, &mut buf).unwrap();
    assert_eq!(&buf[..100], &pattern(2)[..100]);
    assert!(buf[100..].iter().all(|v| *v == 0));
    let text = Va::new(BASE).unwrap();
    assert_eq!(mm.spt().find(text).map(|p| p.ty()), Some(VmType::Anon));

    assert_eq!(
        exe.write(0, b"x"),
        Err(KernelError::TextFileBusy),
        "A running executable must not be writable."
    );
    // Data pages never go back to the executable.
    mm.write_user(BASE + PAGE, b"modified").unwrap();
    assert_eq!(mm.write_user(BASE, b"x"), Err(KernelError::BadAddress));
    assert_eq!(mm.exit_status(), Some(-1));
    assert_eq!(exe.write(0, b"x"), Ok(1), "Exit must allow writes again.");
    let mut data = [0; 8];
    exe.read(PAGE, &mut data).unwrap();
    assert_eq!(&data[..], &pattern(2)[..8]);
}

#[test]
fn load_segment_error() {
    let vm = vm(8);
    let fs = MemFs::new();
    let exe = fs.create("exe", &[0; 4096]).unwrap();
    let mut mm = vm.new_process("exe");
    assert_eq!(
        mm.load_segment(&exe, 0, BASE + 1, PAGE, 0, false),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        mm.load_segment(&exe, 0, BASE, 100, 0, false),
        Err(KernelError::InvalidArgument)
    );
    mm.load_segment(&exe, 0, BASE, PAGE, 0, false).unwrap();
    assert_eq!(
        mm.load_segment(&exe, 0, BASE, PAGE, 0, false),
        Err(KernelError::FileExist)
    );
}
