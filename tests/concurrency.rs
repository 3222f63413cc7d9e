//! Many threads hammering one context.

use guardalloc::{BackendKind, MemConfig, MemContext};
use rand::{rngs::StdRng, Rng, SeedableRng};

const THREADS: u64 = 8;
const ROUNDS: usize = 3_000;

fn context(backend: BackendKind) -> MemContext {
    MemContext::new(MemConfig {
        backend,
        fail_on_leak: false,
        ignore_leaks: false,
        debug_fill: false,
        peak_threshold: 4096,
    })
}

/// Each thread keeps a bag of blocks it owns, filled with its own byte, and
/// randomly allocates, reallocates, duplicates and frees from it. Any block
/// handed to two threads at once would show up as a wrong fill byte.
fn hammer(ctx: &MemContext) {
    crossbeam::thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(t);
                let fill = t as u8 + 1;
                let mut live: Vec<(*mut u8, usize)> = Vec::new();
                for _ in 0..ROUNDS {
                    match rng.gen_range(0..10) {
                        0..=3 => {
                            let size = rng.gen_range(1..512);
                            let p = if rng.gen_bool(0.5) {
                                ctx.malloc_n(size, Some("worker"))
                            } else {
                                ctx.malloc_n_aligned(size, 1 << rng.gen_range(3..10usize), Some("worker"))
                            };
                            unsafe { p.write_bytes(fill, size) };
                            live.push((p, size));
                        }
                        4 | 5 if !live.is_empty() => {
                            let (p, size) = live.swap_remove(rng.gen_range(0..live.len()));
                            let new_size = rng.gen_range(1..1024);
                            let q = unsafe { ctx.realloc_n_id(p, new_size, Some("worker")) };
                            let kept = size.min(new_size);
                            let bytes = unsafe { std::slice::from_raw_parts(q, kept) };
                            assert!(bytes.iter().all(|b| *b == fill));
                            unsafe { q.write_bytes(fill, new_size) };
                            live.push((q, new_size));
                        }
                        6 if !live.is_empty() => {
                            let (p, size) = live[rng.gen_range(0..live.len())];
                            let q = unsafe { ctx.dupalloc_n(p) };
                            live.push((q, size));
                        }
                        _ if !live.is_empty() => {
                            let (p, size) = live.swap_remove(rng.gen_range(0..live.len()));
                            let bytes = unsafe { std::slice::from_raw_parts(p, size) };
                            assert!(bytes.iter().all(|b| *b == fill));
                            unsafe { ctx.free_n(p) };
                        }
                        _ => {}
                    }
                }
                for (p, _) in live {
                    unsafe { ctx.free_n(p) };
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn guarded_backend_survives_contention() {
    let ctx = context(BackendKind::Guarded);
    hammer(&ctx);
    assert_eq!(ctx.num_memory_blocks_in_use(), 0);
    assert_eq!(ctx.num_memory_in_use(), 0);
    assert!(ctx.peak_memory() > 0);
    assert!(ctx.consistency_check_to(&mut String::new()));
    assert_eq!(ctx.report().blocks.map(|b| b.len()), Some(0));
}

#[test]
fn lockfree_backend_survives_contention() {
    let ctx = context(BackendKind::Lockfree);
    hammer(&ctx);
    assert_eq!(ctx.num_memory_blocks_in_use(), 0);
    assert_eq!(ctx.num_memory_in_use(), 0);
}
