//! Many processes competing for a small number of frames.
mod common;

use common::*;
use keos_vm::{MmStruct, page::VmType};
use rand::{Rng, SeedableRng, rngs::StdRng};

const PAGES: usize = 8;

#[test]
fn concurrent_processes() {
    let (vm, _probe) = vm_with_probe(6, 128);
    let handles = (0..4)
        .map(|t| {
            let mut mm = vm.new_process(format!("worker-{}", t));
            std::thread::spawn(move || {
                for i in 0..PAGES {
                    mm.alloc_page(VmType::Anon, BASE + i * PAGE, true).unwrap();
                }
                for round in 0..5 {
                    for i in 0..PAGES {
                        let seed = t * 100 + round * 10 + i;
                        mm.write_user(BASE + i * PAGE, &pattern(seed)).unwrap();
                    }
                    for i in 0..PAGES {
                        let mut buf = vec![0; PAGE];
                        mm.read_user(BASE + i * PAGE, &mut buf).unwrap();
                        let seed = t * 100 + round * 10 + i;
                        assert_eq!(buf, pattern(seed), "Worker {} lost page {}.", t, i);
                    }
                }
                mm.exit(0);
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = vm.stats();
    assert!(stats.evictions > 0);
    assert_eq!(stats.resident_frames, 0);
    assert_eq!(stats.free_frames, 6);
    assert_eq!(stats.free_swap_slots, stats.swap_slots);
}

struct Shadow {
    mm: MmStruct,
    pages: Vec<Vec<u8>>,
}

#[test]
fn random_fork_and_eviction() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let (vm, _probe) = vm_with_probe(4, 128);
    let mut root = vm.new_process("root");
    for i in 0..PAGES {
        root.alloc_page(VmType::Anon, BASE + i * PAGE, true).unwrap();
    }
    let mut procs = vec![Shadow {
        mm: root,
        pages: vec![vec![0; PAGE]; PAGES],
    }];

    for step in 0..2000 {
        let p = rng.gen_range(0..procs.len());
        let page = rng.gen_range(0..PAGES);
        let ofs = rng.gen_range(0..PAGE - 16);
        match rng.gen_range(0..10) {
            0..=3 => {
                let data: [u8; 16] = rng.r#gen();
                let proc = &mut procs[p];
                proc.mm.write_user(BASE + page * PAGE + ofs, &data).unwrap();
                proc.pages[page][ofs..ofs + 16].copy_from_slice(&data);
            }
            4..=7 => {
                let proc = &mut procs[p];
                let mut buf = [0; 16];
                proc.mm.read_user(BASE + page * PAGE + ofs, &mut buf).unwrap();
                assert_eq!(
                    &buf[..],
                    &proc.pages[page][ofs..ofs + 16],
                    "Step {}: process {} page {} diverged.",
                    step,
                    p,
                    page
                );
            }
            8 if procs.len() < 4 => {
                let mm = procs[p].mm.fork(format!("child-{}", step)).unwrap();
                let pages = procs[p].pages.clone();
                procs.push(Shadow { mm, pages });
            }
            9 if procs.len() > 1 => {
                let mut proc = procs.swap_remove(p);
                proc.mm.exit(0);
            }
            _ => (),
        }
    }

    for (p, proc) in procs.iter_mut().enumerate() {
        for page in 0..PAGES {
            let mut buf = vec![0; PAGE];
            proc.mm.read_user(BASE + page * PAGE, &mut buf).unwrap();
            assert_eq!(buf, proc.pages[page], "Process {} page {} diverged.", p, page);
        }
    }
    drop(procs);
    let stats = vm.stats();
    assert_eq!(stats.resident_frames, 0);
    assert_eq!(stats.free_frames, 4);
    assert_eq!(stats.free_swap_slots, stats.swap_slots, "Swap slots leaked.");
}
