//! Synchronization primitive benchmarks.
//!
//! Uncontended fast paths for each primitive, plus a two-thread semaphore
//! ping-pong that measures a full block/wake round trip.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use criterion::{
    BenchmarkGroup, BenchmarkId, Criterion, Throughput, black_box, criterion_group,
    criterion_main, measurement::WallTime,
};
use frankenpthread_core::config::sync_mode;
use frankenpthread_core::pthread::{
    CondAttr, MutexAttr, MutexType, PthreadCond, PthreadMutex, PthreadRwLock, PthreadSpinlock,
    RwLockAttr, Semaphore, thread,
};

#[derive(Default)]
struct BenchStats {
    samples_ns_per_op: Vec<f64>,
    total_iters: u64,
    total_ns: u128,
}

impl BenchStats {
    fn record(&mut self, iters: u64, dur: Duration) {
        let ns = dur.as_nanos();
        self.total_iters = self.total_iters.saturating_add(iters);
        self.total_ns = self.total_ns.saturating_add(ns);
        self.samples_ns_per_op.push(ns as f64 / iters as f64);
    }

    fn report(&self, mode_label: &str, bench_label: &str) {
        let mut samples = self.samples_ns_per_op.clone();
        if samples.is_empty() {
            return;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let p50 = percentile_sorted(&samples, 0.50);
        let p99 = percentile_sorted(&samples, 0.99);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let throughput_ops_s = if self.total_ns == 0 {
            0.0
        } else {
            (self.total_iters as f64) / (self.total_ns as f64 / 1e9)
        };

        println!(
            "SYNC_BENCH mode={mode_label} bench={bench_label} samples={} p50_ns_op={p50:.3} p99_ns_op={p99:.3} mean_ns_op={mean:.3} throughput_ops_s={throughput_ops_s:.3}",
            samples.len(),
        );
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn maybe_pin_thread() {
    if std::env::var("FRANKENPTHREAD_BENCH_PIN").ok().as_deref() != Some("1") {
        return;
    }

    #[cfg(target_os = "linux")]
    unsafe {
        // SAFETY: best-effort pinning; failure is reported and ignored.
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(0, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            eprintln!("SYNC_BENCH_META pinning_failed errno={errno}");
        } else {
            println!("SYNC_BENCH_META pinned_to_cpu=0");
        }
    }
}

fn measure(
    group: &mut BenchmarkGroup<'_, WallTime>,
    mode_label: &str,
    label: &str,
    mut op: impl FnMut(),
) {
    for _ in 0..10_000 {
        op();
    }
    let stats = RefCell::new(BenchStats::default());
    group.bench_function(BenchmarkId::new(label, mode_label), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                op();
            }
            let dur = start.elapsed().max(Duration::from_nanos(1));
            stats.borrow_mut().record(iters, dur);
            dur
        });
    });
    stats.borrow().report(mode_label, label);
}

fn bench_sync(c: &mut Criterion) {
    maybe_pin_thread();
    let mode_label = sync_mode().as_str();

    let mut group = c.benchmark_group("sync");
    group.throughput(Throughput::Elements(1));

    for (label, kind) in [
        ("mutex_lock_unlock_normal", MutexType::Normal),
        ("mutex_lock_unlock_recursive", MutexType::Recursive),
        ("mutex_lock_unlock_errorcheck", MutexType::ErrorCheck),
    ] {
        let m = PthreadMutex::new(&MutexAttr::with_type(kind)).expect("mutex");
        measure(&mut group, mode_label, label, || {
            black_box(m.lock()).ok();
            black_box(m.unlock()).ok();
        });
        m.destroy().expect("destroy");
    }

    {
        let m = PthreadMutex::new(&MutexAttr::new()).expect("mutex");
        m.lock().expect("lock");
        measure(&mut group, mode_label, "mutex_trylock_busy", || {
            black_box(m.try_lock()).ok();
        });
        m.unlock().expect("unlock");
        m.destroy().expect("destroy");
    }

    {
        let spin = PthreadSpinlock::new(0).expect("spinlock");
        measure(&mut group, mode_label, "spin_lock_unlock", || {
            black_box(spin.lock()).ok();
            black_box(spin.unlock()).ok();
        });
        spin.destroy().expect("destroy");
    }

    {
        let sem = Semaphore::new(0, 0).expect("semaphore");
        measure(&mut group, mode_label, "sem_post_wait", || {
            black_box(sem.post()).ok();
            black_box(sem.wait()).ok();
        });
        sem.destroy().expect("destroy");
    }

    {
        let rw = PthreadRwLock::new(&RwLockAttr::new()).expect("rwlock");
        measure(&mut group, mode_label, "rwlock_read_unlock", || {
            black_box(rw.read_lock()).ok();
            black_box(rw.unlock()).ok();
        });
        measure(&mut group, mode_label, "rwlock_write_unlock", || {
            black_box(rw.write_lock()).ok();
            black_box(rw.unlock()).ok();
        });
        rw.destroy().expect("destroy");
    }

    {
        let cv = PthreadCond::new(&CondAttr::new()).expect("cond");
        measure(&mut group, mode_label, "cond_signal_no_waiters", || {
            black_box(cv.signal()).ok();
        });
        cv.destroy().expect("destroy");
    }

    measure(&mut group, mode_label, "thread_self", || {
        black_box(thread::self_id());
    });

    // Ping-pong: each iteration is one wake of the peer and one wake back.
    {
        let ping = Arc::new(Semaphore::new(0, 0).expect("semaphore"));
        let pong = Arc::new(Semaphore::new(0, 0).expect("semaphore"));
        let stop = Arc::new(AtomicBool::new(false));
        let (peer_ping, peer_pong, peer_stop) =
            (Arc::clone(&ping), Arc::clone(&pong), Arc::clone(&stop));
        let peer = std::thread::spawn(move || {
            while peer_ping.wait().is_ok() && !peer_stop.load(Ordering::Acquire) {
                if peer_pong.post().is_err() {
                    break;
                }
            }
        });
        measure(&mut group, mode_label, "sem_ping_pong", || {
            black_box(ping.post()).ok();
            black_box(pong.wait()).ok();
        });
        stop.store(true, Ordering::Release);
        ping.post().expect("post");
        peer.join().expect("peer");
        ping.destroy().expect("destroy");
        pong.destroy().expect("destroy");
    }

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(100);
    targets = bench_sync
);
criterion_main!(benches);
