use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessel_core::{
    AutoLock, AutoTryLock, CheckMode, LocalLock, RtEvent, RtUserEvent, SyncOptions, TaskFrame,
    WaitMode,
};

fn bench_uncontended_guard(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_guard");

    for checks in [CheckMode::Checked, CheckMode::Unchecked] {
        let frame = TaskFrame::new(SyncOptions {
            checks,
            ..SyncOptions::default()
        });
        let lock = LocalLock::with_wait_mode(WaitMode::Spin);
        group.bench_with_input(
            BenchmarkId::new("exclusive", format!("{checks:?}")),
            &checks,
            |b, _| {
                b.iter(|| {
                    let guard = AutoLock::new(&frame, black_box(&lock));
                    black_box(guard.is_held())
                });
            },
        );
    }

    group.finish();
}

fn bench_nested_guards(c: &mut Criterion) {
    let frame = TaskFrame::new(SyncOptions::default());
    let locks: Vec<LocalLock> = (0..4).map(|_| LocalLock::new()).collect();

    c.bench_function("nested_guards_4", |b| {
        b.iter(|| {
            let g0 = AutoLock::new(&frame, &locks[0]);
            let g1 = AutoLock::shared(&frame, &locks[1]);
            let g2 = AutoLock::new(&frame, &locks[2]);
            let g3 = AutoLock::shared(&frame, &locks[3]);
            black_box(frame.held_locks());
            drop(g3);
            drop(g2);
            drop(g1);
            drop(g0);
        });
    });
}

fn bench_try_lock(c: &mut Criterion) {
    let frame = TaskFrame::new(SyncOptions::default());
    let lock = LocalLock::new();

    c.bench_function("try_lock_success", |b| {
        b.iter(|| {
            let attempt = AutoTryLock::new(&frame, black_box(&lock));
            black_box(attempt.has_lock())
        });
    });
}

fn bench_wait_fast_path(c: &mut Criterion) {
    let triggered = RtUserEvent::create();
    triggered.trigger().unwrap();
    let event = triggered.event();

    c.bench_function("wait_triggered", |b| {
        b.iter(|| black_box(&event).wait());
    });

    c.bench_function("wait_no_event", |b| {
        b.iter(|| black_box(&RtEvent::NO_RT_EVENT).wait());
    });
}

criterion_group!(
    benches,
    bench_uncontended_guard,
    bench_nested_guards,
    bench_try_lock,
    bench_wait_fast_path
);
criterion_main!(benches);
