//! The scheduling collaborator.
//!
//! The grace-period algorithm needs to pin threads to workers, rebind them,
//! change priorities and yield. Those services come from a [`Scheduler`];
//! [`LogicalScheduler`] implements them over logical workers so the engine
//! runs on any host.
//!
//! 调度协作者。
//! 宽限期算法需要把线程钉在工作者上、重新绑定、修改优先级并让出处理器。
//! 这些服务由 `Scheduler` 提供；`LogicalScheduler` 在逻辑工作者之上实现它们，
//! 使引擎可以在任何主机上运行。

use crate::slots::SlotArray;
use crate::sync::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Identifies an execution unit (a CPU core, or a logical worker).
/// 标识一个执行单元（CPU 核心或逻辑工作者）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

/// Identifies a thread known to a [`Scheduler`].
///
/// Ids may be reused after the thread exits.
///
/// 标识 `Scheduler` 已知的线程。线程退出后 id 可能被复用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

/// Scheduling priority. Lower values are more urgent.
///
/// 调度优先级。数值越小越紧急。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const DEFAULT: Self = Self(120);
    pub const LOWEST: Self = Self(u8::MAX);

    /// Returns the less urgent of two priorities.
    #[inline]
    pub fn least_urgent(self, other: Self) -> Self {
        self.max(other)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Thread and worker services consumed by the RCU engine.
///
/// Every method without a `TaskId` argument acts on the calling thread.
/// Implementations must be usable from any thread.
///
/// RCU 引擎所使用的线程与工作者服务。
/// 所有不带 `TaskId` 参数的方法都作用于调用线程。
pub trait Scheduler: Send + Sync + 'static {
    /// Number of workers; worker ids are `0..num_workers()`.
    fn num_workers(&self) -> usize;

    /// Id of the calling thread.
    fn current_task(&self) -> TaskId;

    /// Worker the calling thread is running on.
    fn current_worker(&self) -> WorkerId;

    /// Prevents the calling thread from migrating. Nests.
    fn pin(&self);

    /// Undoes one [`Scheduler::pin`].
    fn unpin(&self);

    fn pin_depth(&self) -> u32;

    /// Overwrites the pin depth without migrating.
    fn set_pin_depth(&self, depth: u32);

    fn is_bound(&self) -> bool;

    /// Moves the calling thread to `worker` and keeps it there until [`Scheduler::unbind`].
    fn bind(&self, worker: WorkerId);

    fn unbind(&self);

    fn priority(&self) -> Priority;

    fn set_priority(&self, priority: Priority);

    fn task_priority(&self, task: TaskId) -> Priority;

    /// Whether `task` is currently blocked or sleeping.
    fn task_is_inhibited(&self, task: TaskId) -> bool;

    /// Voluntarily gives up the processor.
    fn yield_now(&self);

    /// Sleeps for roughly `duration`.
    fn pause(&self, duration: Duration);

    /// Whether the whole system is stopped (fatal-error dump, debugger).
    fn is_halted(&self) -> bool;
}

static NEXT_SCHEDULER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

struct TaskState {
    worker: AtomicUsize,
    pin_depth: AtomicU32,
    bound: AtomicBool,
    priority: AtomicU8,
    inhibited: AtomicBool,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            worker: AtomicUsize::new(0),
            pin_depth: AtomicU32::new(0),
            bound: AtomicBool::new(false),
            priority: AtomicU8::new(Priority::DEFAULT.0),
            inhibited: AtomicBool::new(false),
        }
    }
}

struct SchedulerShared {
    id: u64,
    workers: usize,
    next_worker: AtomicUsize,
    tasks: SlotArray<TaskState>,
    halted: AtomicBool,
}

/// Per-thread association between a scheduler and the task slot it handed out.
/// The slot is released when the thread exits.
struct TaskBinding {
    scheduler: Weak<SchedulerShared>,
    scheduler_id: u64,
    task: usize,
}

impl Drop for TaskBinding {
    fn drop(&mut self) {
        if let Some(shared) = self.scheduler.upgrade() {
            shared.tasks.release(self.task);
        }
    }
}

thread_local! {
    static BINDINGS: RefCell<Vec<TaskBinding>> = const { RefCell::new(Vec::new()) };
}

/// A [`Scheduler`] over logical workers.
///
/// Threads are placed on workers round-robin the first time they touch the
/// scheduler and stay there unless they are bound elsewhere or explicitly
/// [migrated](LogicalScheduler::migrate). Priorities are recorded but do not
/// change OS scheduling; yielding and pausing map onto `std::thread`.
///
/// 基于逻辑工作者的 `Scheduler`。
/// 线程在第一次接触调度器时按轮询放置到工作者上，除非被绑定到别处或被显式迁移，
/// 否则一直停留。优先级会被记录，但不会改变操作系统调度。
#[derive(Clone)]
pub struct LogicalScheduler {
    shared: Arc<SchedulerShared>,
}

impl LogicalScheduler {
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a scheduler needs at least one worker");
        Self {
            shared: Arc::new(SchedulerShared {
                id: NEXT_SCHEDULER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                workers,
                next_worker: AtomicUsize::new(0),
                tasks: SlotArray::new(),
                halted: AtomicBool::new(false),
            }),
        }
    }

    /// Marks the whole system as stopped (or running again).
    /// 将整个系统标记为已停止（或重新运行）。
    pub fn set_halted(&self, halted: bool) {
        self.shared.halted.store(halted, Ordering::SeqCst);
    }

    /// Moves the calling thread to `worker`.
    ///
    /// Returns `false` and does nothing if the thread is pinned or bound.
    ///
    /// 将调用线程移动到 `worker`。如果线程被钉住或被绑定，返回 `false` 且不做任何事。
    pub fn migrate(&self, worker: WorkerId) -> bool {
        self.check_worker(worker);
        let task = self.task();
        if task.pin_depth.load(Ordering::Relaxed) > 0 || task.bound.load(Ordering::Relaxed) {
            return false;
        }
        task.worker.store(worker.0, Ordering::Release);
        true
    }

    /// Sleeps while advertising the calling thread as inhibited.
    /// 睡眠，并在此期间将调用线程标记为受抑制状态。
    pub fn sleep(&self, duration: Duration) {
        let task = self.task();
        task.inhibited.store(true, Ordering::Release);
        std::thread::sleep(duration);
        task.inhibited.store(false, Ordering::Release);
    }

    /// Worker that `task` is currently placed on.
    pub fn worker_of(&self, task: TaskId) -> WorkerId {
        WorkerId(self.shared.tasks.get(task.0).worker.load(Ordering::Acquire))
    }

    fn check_worker(&self, worker: WorkerId) {
        assert!(
            worker.0 < self.shared.workers,
            "worker {} out of range (scheduler has {} workers)",
            worker.0,
            self.shared.workers
        );
    }

    fn task(&self) -> &TaskState {
        self.shared.tasks.get(self.current_task().0)
    }

    fn register_current(&self) -> usize {
        let shared = &self.shared;
        let index = shared.tasks.acquire();
        let task = shared.tasks.get(index);
        let worker = shared.next_worker.fetch_add(1, Ordering::Relaxed) % shared.workers;
        task.worker.store(worker, Ordering::Release);
        task.pin_depth.store(0, Ordering::Relaxed);
        task.bound.store(false, Ordering::Relaxed);
        task.priority.store(Priority::DEFAULT.0, Ordering::Release);
        task.inhibited.store(false, Ordering::Release);
        index
    }
}

impl Scheduler for LogicalScheduler {
    fn num_workers(&self) -> usize {
        self.shared.workers
    }

    fn current_task(&self) -> TaskId {
        let id = self.shared.id;
        BINDINGS.with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            if let Some(binding) = bindings.iter().find(|b| b.scheduler_id == id) {
                return TaskId(binding.task);
            }
            // Drop bindings of schedulers that no longer exist.
            bindings.retain(|b| b.scheduler.strong_count() > 0);
            let task = self.register_current();
            bindings.push(TaskBinding {
                scheduler: Arc::downgrade(&self.shared),
                scheduler_id: id,
                task,
            });
            TaskId(task)
        })
    }

    fn current_worker(&self) -> WorkerId {
        WorkerId(self.task().worker.load(Ordering::Acquire))
    }

    fn pin(&self) {
        self.task().pin_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn unpin(&self) {
        let prev = self.task().pin_depth.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "unpin without a matching pin");
    }

    fn pin_depth(&self) -> u32 {
        self.task().pin_depth.load(Ordering::Relaxed)
    }

    fn set_pin_depth(&self, depth: u32) {
        self.task().pin_depth.store(depth, Ordering::Relaxed);
    }

    fn is_bound(&self) -> bool {
        self.task().bound.load(Ordering::Relaxed)
    }

    fn bind(&self, worker: WorkerId) {
        self.check_worker(worker);
        let task = self.task();
        task.worker.store(worker.0, Ordering::Release);
        task.bound.store(true, Ordering::Relaxed);
    }

    fn unbind(&self) {
        self.task().bound.store(false, Ordering::Relaxed);
    }

    fn priority(&self) -> Priority {
        Priority(self.task().priority.load(Ordering::Acquire))
    }

    fn set_priority(&self, priority: Priority) {
        self.task().priority.store(priority.0, Ordering::Release);
    }

    fn task_priority(&self, task: TaskId) -> Priority {
        Priority(self.shared.tasks.get(task.0).priority.load(Ordering::Acquire))
    }

    fn task_is_inhibited(&self, task: TaskId) -> bool {
        self.shared.tasks.get(task.0).inhibited.load(Ordering::Acquire)
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn pause(&self, duration: Duration) {
        self.sleep(duration);
    }

    fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }
}
