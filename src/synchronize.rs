use crate::sched::{Priority, Scheduler, WorkerId};
use crate::state::{RcuType, SharedState, WorkerRecord};
use tracing::trace;

/// Steps of one grace period.
///
/// The waiter always either makes the blocking reader run (local) or moves
/// next to it (remote), so every transition back to `LocateBlocker` follows
/// an action that lets the blocker progress.
///
/// 一次宽限期的各个步骤。
/// 等待者要么让阻塞读者运行（本地），要么移动到它旁边（远程），
/// 因此每次回到 `LocateBlocker` 之前都执行了一个能让阻塞者前进的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraceState {
    AdvanceEpoch,
    LocateBlocker { target: u32 },
    BoostAndYieldLocal { target: u32, worker: WorkerId },
    MigrateAndBoostRemote { target: u32, worker: WorkerId },
    Done,
}

/// Scheduler state of the calling thread, restored on drop.
///
/// Capturing it also parks the thread on its current worker with no pin
/// nesting, so the waiter keeps running on one worker while it waits.
///
/// 调用线程的调度状态，在 drop 时恢复。
/// 捕获时也会把线程停靠在当前工作者上并清除钉住嵌套。
struct SchedulerSnapshot<'a> {
    scheduler: &'a dyn Scheduler,
    worker: WorkerId,
    pin_depth: u32,
    priority: Priority,
    was_bound: bool,
}

impl<'a> SchedulerSnapshot<'a> {
    fn park(scheduler: &'a dyn Scheduler) -> Self {
        let snapshot = Self {
            scheduler,
            worker: scheduler.current_worker(),
            pin_depth: scheduler.pin_depth(),
            priority: scheduler.priority(),
            was_bound: scheduler.is_bound(),
        };
        scheduler.unbind();
        scheduler.set_pin_depth(0);
        scheduler.bind(snapshot.worker);
        snapshot
    }
}

impl Drop for SchedulerSnapshot<'_> {
    fn drop(&mut self) {
        let scheduler = self.scheduler;
        if self.was_bound {
            scheduler.bind(self.worker);
        } else {
            // A pinned caller must come back to the worker it was pinned on.
            if self.pin_depth != 0 {
                scheduler.bind(self.worker);
            }
            scheduler.unbind();
        }
        scheduler.set_pin_depth(self.pin_depth);
        scheduler.set_priority(self.priority);
    }
}

impl SharedState {
    /// Waits until every reader of `kind` that was inside a read-side section
    /// when this call started has left it.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is itself inside a section of `kind`.
    ///
    /// 等待直到调用开始时处于 `kind` 读侧临界区内的每个读者都已离开。
    pub(crate) fn synchronize(&self, kind: RcuType) {
        if self.should_skip() {
            return;
        }

        assert!(
            self.read_depth(kind) == 0,
            "synchronize({}) called inside a read-side critical section of the same domain",
            kind.name()
        );

        let domain = self.domain(kind);
        let scheduler = &*self.scheduler;
        let _snapshot = SchedulerSnapshot::park(scheduler);

        let mut state = GraceState::AdvanceEpoch;
        loop {
            state = match state {
                GraceState::AdvanceEpoch => {
                    let target = domain.epoch.advance();
                    trace!(domain = kind.name(), target, "grace period started");
                    GraceState::LocateBlocker { target }
                }
                GraceState::LocateBlocker { target } => match domain.first_blocker(target) {
                    None => GraceState::Done,
                    Some(worker) if worker == scheduler.current_worker() => {
                        GraceState::BoostAndYieldLocal { target, worker }
                    }
                    Some(worker) => GraceState::MigrateAndBoostRemote { target, worker },
                },
                GraceState::BoostAndYieldLocal { target, worker } => {
                    self.boost_and_yield(domain.record(worker));
                    GraceState::LocateBlocker { target }
                }
                GraceState::MigrateAndBoostRemote { target, worker } => {
                    trace!(domain = kind.name(), worker = worker.0, "moving to blocking worker");
                    scheduler.set_priority(Priority::HIGHEST);
                    scheduler.bind(worker);
                    GraceState::LocateBlocker { target }
                }
                GraceState::Done => break,
            };
        }

        trace!(domain = kind.name(), "grace period completed");
    }

    /// Lets the readers blocking on the waiter's own worker run.
    ///
    /// If any of them sleeps for an unrelated reason, boosting cannot help, so
    /// the waiter backs off for one pause interval instead.
    fn boost_and_yield(&self, record: &WorkerRecord) {
        let scheduler = &*self.scheduler;
        let mut priority = Priority::HIGHEST;
        let mut is_sleeping = false;

        for task in record.readers.iter().filter_map(|(_, entry)| entry.task()) {
            priority = priority.least_urgent(scheduler.task_priority(task));
            is_sleeping |= scheduler.task_is_inhibited(task);
        }

        if is_sleeping {
            trace!(worker = record.worker.0, "blocking reader is sleeping");
            scheduler.pause(self.pause_interval);
        } else {
            scheduler.set_priority(priority);
            scheduler.yield_now();
        }
    }
}
