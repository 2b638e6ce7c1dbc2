use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use punteggi::cache::PendingDeltas;

const NUM_THREADS: usize = 8;
const ITERATIONS_PER_THREAD: usize = 100_000;

fn bench_bump(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_bump");

    group.bench_function(
        BenchmarkId::new(
            "PendingDeltas (atomic cells)",
            format!("{}threads x {}iter", NUM_THREADS, ITERATIONS_PER_THREAD),
        ),
        |b| {
            b.iter(|| {
                let cache = Arc::new(PendingDeltas::new());
                let mut handles = vec![];

                for t in 0..NUM_THREADS {
                    let cache_clone = Arc::clone(&cache);
                    let key = format!("user-{}", t % 4);
                    let handle = thread::spawn(move || {
                        for _ in 0..ITERATIONS_PER_THREAD {
                            cache_clone.bump(&key, 1);
                        }
                    });
                    handles.push(handle);
                }

                for handle in handles {
                    handle.join().unwrap();
                }

                black_box(cache.peek("user-0"))
            })
        },
    );

    group.bench_function(
        BenchmarkId::new(
            "Mutex<HashMap> (naive)",
            format!("{}threads x {}iter", NUM_THREADS, ITERATIONS_PER_THREAD),
        ),
        |b| {
            b.iter(|| {
                let cache: Arc<Mutex<HashMap<String, i64>>> =
                    Arc::new(Mutex::new(HashMap::new()));
                let mut handles = vec![];

                for t in 0..NUM_THREADS {
                    let cache_clone = Arc::clone(&cache);
                    let key = format!("user-{}", t % 4);
                    let handle = thread::spawn(move || {
                        for _ in 0..ITERATIONS_PER_THREAD {
                            *cache_clone.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
                        }
                    });
                    handles.push(handle);
                }

                for handle in handles {
                    handle.join().unwrap();
                }

                black_box(cache.lock().unwrap().get("user-0").copied())
            })
        },
    );

    group.finish();
}

criterion_group!(benches, bench_bump);
criterion_main!(benches);
