use crate::callback::Callback;
use crate::epoch::{EpochCounter, EpochRecord};
use crate::sched::{Scheduler, TaskId, WorkerId};
use crate::slots::SlotArray;
use crate::sync::{AtomicBool, AtomicUsize, Mutex, Ordering};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Default bounded sleep while a blocking reader is itself asleep (one tick).
/// 当阻塞读者自身在睡眠时的默认有界睡眠时长（一个时钟节拍）。
pub(crate) const DEFAULT_PAUSE_INTERVAL: Duration = Duration::from_millis(1);

/// Default name prefix of the drain worker threads.
/// 回调排空工作线程的默认名称前缀。
pub(crate) const DEFAULT_THREAD_NAME: &str = "rcu-drain";

/// Marks a reader entry whose task id is not published yet.
/// 标记任务 id 尚未发布的读者条目。
pub(crate) const NO_TASK: usize = usize::MAX;

/// Selects one of the reclamation domains of an engine.
///
/// Each domain has its own epoch, per-worker records and callback queue, so a
/// grace period of one domain never waits for readers of the other.
///
/// 选择引擎的一个回收域。
/// 每个域有自己的纪元、每工作者记录和回调队列，因此一个域的宽限期不会等待另一个域的读者。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RcuType {
    /// Classic RCU; read-side sections should not sleep.
    Regular,
    /// Sleepable RCU; read-side sections may block.
    Sleepable,
}

impl RcuType {
    pub const COUNT: usize = 2;
    pub const ALL: [RcuType; Self::COUNT] = [RcuType::Regular, RcuType::Sleepable];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            RcuType::Regular => 0,
            RcuType::Sleepable => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            RcuType::Regular => "regular",
            RcuType::Sleepable => "sleepable",
        }
    }
}

/// One thread inside an outermost read-side section on a worker.
/// 在某工作者上处于最外层读侧临界区内的一个线程。
#[derive(Debug)]
pub(crate) struct ReaderEntry {
    pub(crate) task: AtomicUsize,
}

impl Default for ReaderEntry {
    fn default() -> Self {
        Self {
            task: AtomicUsize::new(NO_TASK),
        }
    }
}

impl ReaderEntry {
    #[inline]
    pub(crate) fn task(&self) -> Option<TaskId> {
        match self.task.load(Ordering::Acquire) {
            NO_TASK => None,
            task => Some(TaskId(task)),
        }
    }
}

/// Per-worker participation record of one domain.
///
/// Only threads pinned to `worker` touch `epoch` and `readers` for writing;
/// the grace-period code reads both from any worker.
///
/// 一个域的每工作者参与记录。
/// 只有钉在 `worker` 上的线程会写入 `epoch` 和 `readers`；宽限期代码可从任何工作者读取。
pub(crate) struct WorkerRecord {
    pub(crate) worker: WorkerId,
    registered: AtomicBool,
    pub(crate) epoch: EpochRecord,
    pub(crate) readers: SlotArray<ReaderEntry>,
}

impl WorkerRecord {
    fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            registered: AtomicBool::new(false),
            epoch: EpochRecord::new(),
            readers: SlotArray::new(),
        }
    }

    #[inline]
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Returns `true` if this call performed the registration.
    pub(crate) fn register(&self) -> bool {
        !self.registered.swap(true, Ordering::AcqRel)
    }

    /// Inserts `task` in the reader set and returns its slot.
    pub(crate) fn add_reader(&self, task: TaskId) -> usize {
        let slot = self.readers.acquire();
        self.readers.get(slot).task.store(task.0, Ordering::Release);
        slot
    }

    pub(crate) fn remove_reader(&self, slot: usize) {
        self.readers.get(slot).task.store(NO_TASK, Ordering::Release);
        self.readers.release(slot);
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.iter().filter(|(_, e)| e.task().is_some()).count()
    }
}

/// State of one reclamation domain.
/// 一个回收域的状态。
pub(crate) struct Domain {
    pub(crate) kind: RcuType,
    pub(crate) epoch: EpochCounter,
    pub(crate) records: Box<[CachePadded<WorkerRecord>]>,
    pub(crate) callbacks: Mutex<VecDeque<Callback>>,
}

impl Domain {
    fn new(kind: RcuType, workers: usize) -> Self {
        Self {
            kind,
            epoch: EpochCounter::new(),
            records: (0..workers)
                .map(|w| CachePadded::new(WorkerRecord::new(WorkerId(w))))
                .collect(),
            callbacks: Mutex::new(VecDeque::new()),
        }
    }

    /// Record of `worker`, which must be registered.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is out of range or not registered.
    #[inline]
    pub(crate) fn registered_record(&self, worker: WorkerId) -> &WorkerRecord {
        let record = self.record(worker);
        assert!(
            record.is_registered(),
            "worker {} is not registered for the {} domain",
            worker.0,
            self.kind.name()
        );
        record
    }

    /// # Panics
    ///
    /// Panics if `worker` is out of range.
    #[inline]
    pub(crate) fn record(&self, worker: WorkerId) -> &WorkerRecord {
        assert!(
            worker.0 < self.records.len(),
            "worker {} out of range ({} workers)",
            worker.0,
            self.records.len()
        );
        &self.records[worker.0]
    }

    /// First registered worker still holding readers that entered before `target`.
    pub(crate) fn first_blocker(&self, target: u32) -> Option<WorkerId> {
        self.records
            .iter()
            .filter(|record| record.is_registered())
            .find(|record| record.epoch.is_blocking(target))
            .map(|record| record.worker)
    }
}

/// Process-wide (per engine) shared state.
///
/// Contains the scheduler collaborator, one [`Domain`] per [`RcuType`] and the
/// configuration the hot paths consult.
///
/// 引擎级共享状态。
/// 包含调度协作者、每个 `RcuType` 一个 `Domain`，以及热路径需要查询的配置。
pub(crate) struct SharedState {
    pub(crate) id: u64,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) domains: [Domain; RcuType::COUNT],
    pub(crate) pause_interval: Duration,
    pub(crate) skip_when_halted: bool,
}

impl SharedState {
    pub(crate) fn new(
        id: u64,
        scheduler: Arc<dyn Scheduler>,
        pause_interval: Duration,
        skip_when_halted: bool,
    ) -> Self {
        let workers = scheduler.num_workers();
        Self {
            id,
            scheduler,
            domains: RcuType::ALL.map(|kind| Domain::new(kind, workers)),
            pause_interval,
            skip_when_halted,
        }
    }

    #[inline]
    pub(crate) fn domain(&self, kind: RcuType) -> &Domain {
        &self.domains[kind.index()]
    }

    /// Whether every operation should degrade to a no-op.
    #[inline]
    pub(crate) fn should_skip(&self) -> bool {
        self.skip_when_halted && self.scheduler.is_halted()
    }
}
