/// 并发测试模块
/// 测试宽限期等待、调度状态恢复和并发入队场景
use crate::{LogicalScheduler, Priority, Rcu, RcuType, Scheduler, WorkerId};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// 在 `worker` 上启动一个读者线程：进入临界区后通知 `entered`，
/// 保持 `hold` 时长，设置 `released` 后离开
fn spawn_reader(
    rcu: &Rcu,
    sched: &LogicalScheduler,
    worker: WorkerId,
    hold: Duration,
    sleeping: bool,
    entered: Arc<Barrier>,
    released: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let rcu = rcu.clone();
    let sched = sched.clone();
    thread::spawn(move || {
        assert!(sched.migrate(worker));
        let guard = rcu.read(RcuType::Regular);
        entered.wait();
        if sleeping {
            sched.sleep(hold);
        } else {
            thread::sleep(hold);
        }
        released.store(true, Ordering::SeqCst);
        drop(guard);
    })
}

/// 测试1: synchronize 等待另一个工作者上的读者
#[test]
fn test_synchronize_waits_for_remote_reader() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    assert!(sched.migrate(WorkerId(0)));
    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(1),
        Duration::from_millis(50),
        false,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Regular);
    assert!(released.load(Ordering::SeqCst));

    reader.join().unwrap();
}

/// 测试2: synchronize 等待同一工作者上的读者
#[test]
fn test_synchronize_waits_for_local_reader() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    assert!(sched.migrate(WorkerId(0)));
    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(0),
        Duration::from_millis(50),
        false,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Regular);
    assert!(released.load(Ordering::SeqCst));

    reader.join().unwrap();
}

/// 测试3: 读者在临界区内睡眠时，synchronize 退避等待而不是提前返回
#[test]
fn test_synchronize_waits_for_sleeping_reader() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder()
        .scheduler(sched.clone())
        .pause_interval(Duration::from_millis(2))
        .build()
        .unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    assert!(sched.migrate(WorkerId(0)));
    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(0),
        Duration::from_millis(50),
        true,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Regular);
    assert!(released.load(Ordering::SeqCst));

    reader.join().unwrap();
}

/// 测试4: 可睡眠域的宽限期不等待常规域的读者
#[test]
fn test_sleepable_grace_period_ignores_regular_readers() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(1),
        Duration::from_millis(200),
        false,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Sleepable);
    assert!(!released.load(Ordering::SeqCst));

    reader.join().unwrap();
}

/// 测试5: 被钉住的调用者在 synchronize 后回到原工作者，钉住深度和优先级恢复
#[test]
fn test_synchronize_restores_pinned_caller() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    assert!(sched.migrate(WorkerId(0)));
    sched.set_priority(Priority(50));
    sched.pin();

    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(1),
        Duration::from_millis(30),
        false,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Regular);

    assert_eq!(sched.current_worker(), WorkerId(0));
    assert_eq!(sched.pin_depth(), 1);
    assert!(!sched.is_bound());
    assert_eq!(sched.priority(), Priority(50));

    sched.unpin();
    reader.join().unwrap();
}

/// 测试6: 已绑定的调用者在 synchronize 后仍绑定在原工作者上
#[test]
fn test_synchronize_restores_bound_caller() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    sched.bind(WorkerId(1));

    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(0),
        Duration::from_millis(30),
        false,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Regular);

    assert!(sched.is_bound());
    assert_eq!(sched.current_worker(), WorkerId(1));
    assert_eq!(sched.pin_depth(), 0);
    assert_eq!(sched.priority(), Priority::DEFAULT);

    sched.unbind();
    reader.join().unwrap();
}

/// 测试7: 未钉住未绑定的调用者在 synchronize 后保持未绑定
#[test]
fn test_synchronize_restores_free_caller() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    assert!(sched.migrate(WorkerId(0)));
    sched.set_priority(Priority::LOWEST);

    let reader = spawn_reader(
        &rcu,
        &sched,
        WorkerId(1),
        Duration::from_millis(30),
        false,
        entered.clone(),
        released.clone(),
    );

    entered.wait();
    rcu.synchronize(RcuType::Regular);

    assert!(!sched.is_bound());
    assert_eq!(sched.pin_depth(), 0);
    assert_eq!(sched.priority(), Priority::LOWEST);
    // 未绑定的调用者可以再次迁移
    assert!(sched.migrate(WorkerId(0)));

    reader.join().unwrap();
}

/// 测试8: 在另一个域的临界区内调用 synchronize，返回后读侧状态不变
#[test]
fn test_synchronize_inside_other_domain_section() {
    let sched = LogicalScheduler::new(2);
    let rcu = Rcu::builder().scheduler(sched.clone()).build().unwrap();

    let worker = sched.current_worker();
    let guard = rcu.read(RcuType::Sleepable);
    rcu.synchronize(RcuType::Regular);

    assert_eq!(sched.current_worker(), worker);
    assert_eq!(sched.pin_depth(), 1);
    assert_eq!(rcu.active_readers(RcuType::Sleepable, worker), 1);
    drop(guard);
    assert_eq!(rcu.active_readers(RcuType::Sleepable, worker), 0);
}

/// 测试9: 持续并发入队时 barrier 仍然返回，且覆盖调用前入队的回调
#[test]
fn test_barrier_with_concurrent_enqueuers() {
    let rcu = Rcu::builder().workers(4).build().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let background = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = rcu.clone();
            let stop = stop.clone();
            let background = background.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let background = background.clone();
                    rcu.call_rcu(RcuType::Regular, move || {
                        background.fetch_add(1, Ordering::Relaxed);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for _ in 0..5 {
        let marker = Arc::new(AtomicBool::new(false));
        {
            let marker = marker.clone();
            rcu.call_rcu(RcuType::Regular, move || marker.store(true, Ordering::SeqCst));
        }
        rcu.barrier(RcuType::Regular);
        assert!(marker.load(Ordering::SeqCst));
    }

    stop.store(true, Ordering::Relaxed);
    for producer in producers {
        producer.join().unwrap();
    }
    rcu.barrier(RcuType::Regular);
    assert_eq!(rcu.pending_callbacks(RcuType::Regular), 0);
}

/// 测试10: 多读者并发读取，写者替换指针并延迟释放，读者永远看不到已释放的版本
#[test]
fn test_readers_never_observe_reclaimed_versions() {
    const VERSIONS: usize = 200;

    struct Version {
        id: usize,
        freed: Arc<Vec<AtomicBool>>,
    }

    impl Drop for Version {
        fn drop(&mut self) {
            self.freed[self.id].store(true, Ordering::SeqCst);
        }
    }

    let rcu = Rcu::builder().workers(4).build().unwrap();
    let freed: Arc<Vec<AtomicBool>> = Arc::new((0..=VERSIONS).map(|_| AtomicBool::new(false)).collect());
    let current = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(Version {
        id: 0,
        freed: freed.clone(),
    }))));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = rcu.clone();
            let current = current.clone();
            let freed = freed.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let _guard = rcu.read(RcuType::Regular);
                    // SAFETY: versions are only dropped after a grace period.
                    let id = unsafe { (*current.load(Ordering::Acquire)).id };
                    thread::yield_now();
                    assert!(!freed[id].load(Ordering::SeqCst), "version {id} freed under a reader");
                }
            })
        })
        .collect();

    for id in 1..=VERSIONS {
        let next = Box::into_raw(Box::new(Version {
            id,
            freed: freed.clone(),
        }));
        let old = current.swap(next, Ordering::AcqRel);
        // SAFETY: `old` came from `Box::into_raw` and is no longer reachable for new readers.
        rcu.defer_drop(RcuType::Regular, unsafe { Box::from_raw(old) });
    }

    done.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    rcu.barrier(RcuType::Regular);
    assert!(freed[..VERSIONS].iter().all(|f| f.load(Ordering::SeqCst)));
    assert!(!freed[VERSIONS].load(Ordering::SeqCst));

    unsafe { drop(Box::from_raw(current.load(Ordering::Relaxed))) };
}

/// 测试11: 多个线程同时调用 synchronize
#[test]
fn test_concurrent_synchronize_calls() {
    let rcu = Rcu::builder().workers(2).build().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let rcu = rcu.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    {
                        let _guard = rcu.read(RcuType::Regular);
                    }
                    rcu.synchronize(RcuType::Regular);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(rcu.current_epoch(RcuType::Regular) >= 80);
}
