#![allow(dead_code)]

use abyss::dev::{RamDisk, SECTOR_SIZE};
use keos::{
    KernelError,
    fs::{Disk, Sector},
};
use keos_vm::{SECTORS_PER_SLOT, Vm, VmConfig};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Start of the region the scenarios put their pages in.
pub const BASE: usize = 0x1000_0000;

pub const PAGE: usize = 0x1000;

/// A swap disk that counts accesses and can be told to fail.
#[derive(Clone, Default)]
pub struct Probe {
    pub reads: Arc<AtomicUsize>,
    pub writes: Arc<AtomicUsize>,
    pub fail_writes: Arc<AtomicBool>,
    pub fail_reads: Arc<AtomicBool>,
}

impl Probe {
    pub fn disk(&self, slots: usize) -> Disk {
        let probe = self.clone();
        Disk::new(Arc::new(RamDisk::new(slots * SECTORS_PER_SLOT))).hook(Arc::new(
            move |_: Sector, _: &[u8; SECTOR_SIZE], is_write: bool| {
                let (cnt, fail) = if is_write {
                    (&probe.writes, &probe.fail_writes)
                } else {
                    (&probe.reads, &probe.fail_reads)
                };
                if fail.load(Ordering::SeqCst) {
                    return Err(KernelError::IOError);
                }
                cnt.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

pub fn vm(frames: usize) -> Vm {
    Vm::new(VmConfig::new().frames(frames))
}

pub fn vm_with_probe(frames: usize, slots: usize) -> (Vm, Probe) {
    let probe = Probe::default();
    let vm = Vm::new(VmConfig::new().frames(frames).swap_disk(probe.disk(slots)));
    (vm, probe)
}

/// A page worth of bytes that depends on `seed`.
pub fn pattern(seed: usize) -> Vec<u8> {
    (0..PAGE).map(|i| ((i * 7 + seed * 13) % 251) as u8).collect()
}
