use crate::Result;
use crate::callback::{Callback, RetiredObject};
use crate::drain::DrainTask;
use crate::reader::ReadGuard;
use crate::sched::{LogicalScheduler, Scheduler, WorkerId};
use crate::srcu::Srcu;
use crate::state::{DEFAULT_PAUSE_INTERVAL, DEFAULT_THREAD_NAME, RcuType, SharedState};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

// Distinguishes engines in the per-thread nesting table.
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);

/// Builder for configuring an [`Rcu`] engine.
///
/// - `workers`: number of logical workers of the default scheduler
/// - `scheduler`: a custom [`Scheduler`] instead of the default one
/// - `pause_interval`: back-off while a blocking reader sleeps
/// - `skip_when_halted`: turn every operation into a no-op while the scheduler reports a halt
/// - `auto_register`: register every worker for every domain at build time
/// - `thread_name`: name prefix of the drain worker threads
///
/// # Example
/// ```
/// use epoch_rcu::Rcu;
/// use std::time::Duration;
///
/// let rcu = Rcu::builder()
///     .workers(4)
///     .pause_interval(Duration::from_millis(2))
///     .thread_name("my-rcu")
///     .build()
///     .unwrap();
/// assert_eq!(rcu.num_workers(), 4);
/// ```
///
/// 用于配置 [`Rcu`] 引擎的构建器。
pub struct RcuBuilder {
    workers: Option<usize>,
    scheduler: Option<Arc<dyn Scheduler>>,
    pause_interval: Duration,
    skip_when_halted: bool,
    auto_register: bool,
    thread_name: String,
}

impl RcuBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            workers: None,
            scheduler: None,
            pause_interval: DEFAULT_PAUSE_INTERVAL,
            skip_when_halted: true,
            auto_register: true,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }

    /// Set the number of workers.
    ///
    /// Sizes the default [`LogicalScheduler`]. When combined with
    /// [`scheduler`](Self::scheduler), it must match the scheduler's count.
    ///
    /// Default: `std::thread::available_parallelism()`
    ///
    /// 设置工作者数量。
    /// 决定默认 `LogicalScheduler` 的大小；与 `scheduler` 同时使用时必须与其数量一致。
    #[inline]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Use a custom scheduling collaborator.
    /// 使用自定义的调度协作者。
    #[inline]
    pub fn scheduler<S: Scheduler>(mut self, scheduler: S) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Set how long a grace period backs off when a blocking reader is asleep.
    ///
    /// Default: 1 ms
    ///
    /// 设置当阻塞读者处于睡眠时宽限期的退避时长。
    #[inline]
    pub fn pause_interval(mut self, interval: Duration) -> Self {
        self.pause_interval = interval;
        self
    }

    /// Whether every operation returns immediately while
    /// [`Scheduler::is_halted`] is `true`.
    ///
    /// Default: `true`
    ///
    /// 当 `Scheduler::is_halted` 为 `true` 时，是否让所有操作立即返回。
    #[inline]
    pub fn skip_when_halted(mut self, skip: bool) -> Self {
        self.skip_when_halted = skip;
        self
    }

    /// Whether `build` registers every worker for every domain.
    ///
    /// When disabled, workers must be added with [`Rcu::register_worker`]
    /// before threads on them enter read-side sections.
    ///
    /// Default: `true`
    ///
    /// `build` 是否为每个域注册所有工作者。
    /// 禁用时，必须在线程进入读侧临界区之前用 `Rcu::register_worker` 注册工作者。
    #[inline]
    pub fn auto_register(mut self, auto: bool) -> Self {
        self.auto_register = auto;
        self
    }

    /// Set the drain worker thread name prefix; threads are named `<prefix>-<domain>`.
    ///
    /// Default: `"rcu-drain"`
    ///
    /// 设置回调排空线程的名称前缀；线程命名为 `<prefix>-<domain>`。
    #[inline]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Build the engine and start one drain worker per domain.
    ///
    /// # Errors
    ///
    /// - [`Error::NoWorkers`](crate::Error::NoWorkers) if the worker count is zero
    /// - [`Error::WorkerCountMismatch`](crate::Error::WorkerCountMismatch) if
    ///   `workers` disagrees with the custom scheduler
    /// - [`Error::Spawn`](crate::Error::Spawn) if a drain thread cannot start
    ///
    /// 构建引擎，并为每个域启动一个回调排空工作者。
    pub fn build(self) -> Result<Rcu> {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => {
                let available = scheduler.num_workers();
                if let Some(requested) = self.workers.filter(|&w| w != available) {
                    return Err(crate::Error::WorkerCountMismatch {
                        requested,
                        scheduler: available,
                    });
                }
                scheduler
            }
            None => {
                let workers = match self.workers {
                    Some(workers) => workers,
                    None => std::thread::available_parallelism().map_or(1, |n| n.get()),
                };
                if workers == 0 {
                    return Err(crate::Error::NoWorkers);
                }
                Arc::new(LogicalScheduler::new(workers))
            }
        };

        let workers = scheduler.num_workers();
        if workers == 0 {
            return Err(crate::Error::NoWorkers);
        }

        let shared = Arc::new(SharedState::new(
            NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            scheduler,
            self.pause_interval,
            self.skip_when_halted,
        ));

        if self.auto_register {
            for kind in RcuType::ALL {
                for worker in 0..workers {
                    shared.domain(kind).record(WorkerId(worker)).register();
                }
            }
        }

        let mut drains = Vec::with_capacity(RcuType::COUNT);
        for kind in RcuType::ALL {
            let shared = shared.clone();
            let name = format!("{}-{}", self.thread_name, kind.name());
            drains.push(DrainTask::spawn(name, move || shared.run_callbacks(kind))?);
        }

        debug!(
            engine = shared.id,
            workers,
            auto_register = self.auto_register,
            skip_when_halted = self.skip_when_halted,
            "rcu engine started"
        );

        Ok(Rcu {
            inner: Arc::new(RcuInner { shared, drains }),
        })
    }
}

impl Default for RcuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RcuInner {
    shared: Arc<SharedState>,
    // Indexed by `RcuType::index`.
    drains: Vec<DrainTask>,
}

impl Drop for RcuInner {
    fn drop(&mut self) {
        debug!(
            engine = self.shared.id,
            pending_regular = self.shared.pending_callbacks(RcuType::Regular),
            pending_sleepable = self.shared.pending_callbacks(RcuType::Sleepable),
            "rcu engine shutting down"
        );
        // Each `DrainTask` runs outstanding callbacks before its thread exits.
    }
}

/// An epoch-based read-copy-update engine.
///
/// `Rcu` owns one reclamation domain per [`RcuType`]. Each domain has a
/// global epoch, one record per worker and a queue of deferred callbacks that
/// a background thread runs after a grace period.
///
/// `Rcu` is `Clone` and cheap to share: every clone refers to the same
/// engine. The drain threads stop once the last clone is dropped, after
/// running every callback still queued.
///
/// **Typical Usage**:
/// ```
/// use epoch_rcu::{Rcu, RcuType};
/// use std::sync::atomic::{AtomicPtr, Ordering};
///
/// let rcu = Rcu::builder().workers(2).build().unwrap();
/// let shared = AtomicPtr::new(Box::into_raw(Box::new(1u64)));
///
/// {
///     let _guard = rcu.read(RcuType::Regular);
///     let value = unsafe { *shared.load(Ordering::Acquire) };
///     assert_eq!(value, 1);
/// }
///
/// let old = shared.swap(Box::into_raw(Box::new(2u64)), Ordering::AcqRel);
/// rcu.defer_drop(RcuType::Regular, unsafe { Box::from_raw(old) });
/// rcu.barrier(RcuType::Regular);
/// # unsafe { drop(Box::from_raw(shared.load(Ordering::Relaxed))) };
/// ```
///
/// 基于纪元的读-复制-更新引擎。
/// `Rcu` 为每个 `RcuType` 拥有一个回收域，每个域有一个全局纪元、
/// 每个工作者一条记录，以及一个由后台线程在宽限期之后执行的延迟回调队列。
/// `Rcu` 是 `Clone` 的，所有克隆指向同一个引擎。
/// 最后一个克隆被 drop 后，排空线程在执行完队列中剩余的回调后停止。
#[derive(Clone)]
pub struct Rcu {
    inner: Arc<RcuInner>,
}

impl Rcu {
    /// Create an engine with default settings.
    /// 使用默认设置创建引擎。
    #[inline]
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a builder for configuring the engine.
    /// 创建一个用于配置引擎的构建器。
    #[inline]
    pub fn builder() -> RcuBuilder {
        RcuBuilder::new()
    }

    #[inline]
    fn shared(&self) -> &SharedState {
        &self.inner.shared
    }

    #[inline]
    fn drain_task(&self, kind: RcuType) -> &DrainTask {
        &self.inner.drains[kind.index()]
    }

    /// Register `worker` as a participant of `kind`.
    ///
    /// Idempotent; returns `true` only for the call that performed the
    /// registration.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is out of range.
    ///
    /// 将 `worker` 注册为 `kind` 的参与者。幂等；只有实际完成注册的调用返回 `true`。
    pub fn register_worker(&self, kind: RcuType, worker: WorkerId) -> bool {
        let newly = self.shared().domain(kind).record(worker).register();
        if newly {
            debug!(
                engine = self.shared().id,
                domain = kind.name(),
                worker = worker.0,
                "worker registered"
            );
        }
        newly
    }

    /// # Panics
    ///
    /// Panics if `worker` is out of range.
    pub fn is_registered(&self, kind: RcuType, worker: WorkerId) -> bool {
        self.shared().domain(kind).record(worker).is_registered()
    }

    /// Enter a read-side critical section of `kind`.
    ///
    /// Sections nest. The calling thread stays pinned to its worker until the
    /// matching [`read_unlock`](Self::read_unlock). Prefer [`read`](Self::read).
    ///
    /// # Panics
    ///
    /// Panics if the current worker is not registered for `kind`.
    ///
    /// 进入 `kind` 的读侧临界区。临界区可以嵌套；
    /// 调用线程在匹配的 `read_unlock` 之前一直钉在当前工作者上。
    #[inline]
    pub fn read_lock(&self, kind: RcuType) {
        self.shared().read_lock(kind);
    }

    /// Leave a read-side critical section of `kind`.
    ///
    /// # Panics
    ///
    /// Panics without a matching [`read_lock`](Self::read_lock) on this thread.
    ///
    /// 离开 `kind` 的读侧临界区。
    #[inline]
    pub fn read_unlock(&self, kind: RcuType) {
        self.shared().read_unlock(kind);
    }

    /// Enter a read-side critical section that ends when the guard drops.
    /// 进入一个读侧临界区，守卫被 drop 时结束。
    #[inline]
    pub fn read(&self, kind: RcuType) -> ReadGuard<'_> {
        ReadGuard::new(self, kind)
    }

    /// Nesting depth of the calling thread in `kind`.
    #[inline]
    pub fn read_depth(&self, kind: RcuType) -> u32 {
        self.shared().read_depth(kind)
    }

    /// Wait for a grace period of `kind`.
    ///
    /// Returns once every reader that was inside a section of `kind` when the
    /// call started has left it. Readers that entered afterwards are not
    /// waited for. The caller's worker binding, pin depth and priority are
    /// restored before returning.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is inside a section of `kind`.
    ///
    /// 等待 `kind` 的一个宽限期。
    /// 当调用开始时处于 `kind` 临界区内的每个读者都离开后返回；之后进入的读者不会被等待。
    /// 返回前恢复调用者的工作者绑定、钉住深度和优先级。
    pub fn synchronize(&self, kind: RcuType) {
        self.shared().synchronize(kind);
    }

    /// Run `f` once a grace period has elapsed.
    ///
    /// Never blocks. Callbacks of one domain run in enqueue order on that
    /// domain's drain thread.
    ///
    /// 在一个宽限期之后执行 `f`。从不阻塞；同一域的回调按入队顺序在该域的排空线程上执行。
    pub fn call_rcu<F>(&self, kind: RcuType, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(kind, Callback::Call(Box::new(f)));
    }

    /// Drop `value` once a grace period has elapsed.
    /// 在一个宽限期之后 drop `value`。
    pub fn defer_drop<T: Send + 'static>(&self, kind: RcuType, value: Box<T>) {
        self.enqueue(kind, Callback::Free(RetiredObject::new(value)));
    }

    /// Drop the `Box<T>` that contains `field` once a grace period has elapsed.
    ///
    /// `offset` is the byte offset of `field` inside `T` (see
    /// [`std::mem::offset_of!`]).
    ///
    /// # Safety
    ///
    /// `field` must point `offset` bytes past the start of a `T` that was
    /// allocated with `Box<T>`, and ownership of that box passes to the engine.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not inside `T`.
    ///
    /// 在一个宽限期之后 drop 包含 `field` 的 `Box<T>`。`offset` 是 `field` 在 `T` 内的字节偏移。
    pub unsafe fn defer_drop_container<T: Send + 'static>(
        &self,
        kind: RcuType,
        field: NonNull<u8>,
        offset: usize,
    ) {
        // SAFETY: forwarded from the caller.
        let object = unsafe { RetiredObject::from_field::<T>(field, offset) };
        self.enqueue(kind, Callback::Free(object));
    }

    fn enqueue(&self, kind: RcuType, callback: Callback) {
        self.shared().enqueue_callback(kind, callback);
        self.drain_task(kind).enqueue();
    }

    /// Block until every callback of `kind` enqueued before this call has run.
    ///
    /// # Panics
    ///
    /// Panics if called inside a section of `kind`, or from a callback
    /// running on the drain thread of `kind`.
    ///
    /// 阻塞直到此调用之前入队的 `kind` 的每个回调都已执行。
    pub fn barrier(&self, kind: RcuType) {
        let drain = self.drain_task(kind);
        assert!(
            !drain.is_worker_thread(),
            "barrier({}) called from a callback running on its own drain worker",
            kind.name()
        );
        // Skipped while halted; the drain pass then skips its grace period too.
        self.synchronize(kind);
        drain.drain();
    }

    /// Current global epoch of `kind`.
    #[inline]
    pub fn current_epoch(&self, kind: RcuType) -> u32 {
        self.shared().domain(kind).epoch.current()
    }

    /// Number of callbacks of `kind` waiting for their drain pass.
    #[inline]
    pub fn pending_callbacks(&self, kind: RcuType) -> usize {
        self.shared().pending_callbacks(kind)
    }

    /// Number of threads inside an outermost section of `kind` on `worker`.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is out of range.
    pub fn active_readers(&self, kind: RcuType, worker: WorkerId) -> usize {
        self.shared().domain(kind).record(worker).reader_count()
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared().scheduler.num_workers()
    }

    /// The scheduling collaborator the engine runs on.
    #[inline]
    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.shared().scheduler
    }

    /// A sleepable-RCU handle sharing this engine.
    /// 共享此引擎的可睡眠 RCU 句柄。
    #[inline]
    pub fn srcu(&self) -> Srcu {
        Srcu::new(self)
    }
}
