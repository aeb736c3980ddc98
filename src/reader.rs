use crate::domain::Rcu;
use crate::sched::WorkerId;
use crate::state::{RcuType, SharedState};
use std::cell::RefCell;
use std::marker::PhantomData;

/// Read-side bookkeeping of one thread for one engine.
///
/// `depth` is the nesting counter per domain; `worker` and `slot` remember
/// where the outermost section registered so the matching exit finds the
/// same record.
///
/// 一个线程针对一个引擎的读侧簿记。
/// `depth` 是每个域的嵌套计数；`worker` 和 `slot` 记录最外层临界区注册的位置，
/// 以便匹配的退出能找到同一条记录。
struct ReaderNest {
    engine: u64,
    depth: [u32; RcuType::COUNT],
    worker: [WorkerId; RcuType::COUNT],
    slot: [usize; RcuType::COUNT],
}

impl ReaderNest {
    fn new(engine: u64) -> Self {
        Self {
            engine,
            depth: [0; RcuType::COUNT],
            worker: [WorkerId(0); RcuType::COUNT],
            slot: [0; RcuType::COUNT],
        }
    }

    fn is_idle(&self) -> bool {
        self.depth.iter().all(|&d| d == 0)
    }
}

thread_local! {
    // Entries exist only while the thread is inside at least one section.
    static NESTS: RefCell<Vec<ReaderNest>> = const { RefCell::new(Vec::new()) };
}

impl SharedState {
    /// Enters a read-side critical section of `kind` on the calling thread.
    ///
    /// 在调用线程上进入 `kind` 的读侧临界区。
    pub(crate) fn read_lock(&self, kind: RcuType) {
        if self.should_skip() {
            return;
        }

        // Pin so that the unlock finds the same per-worker record.
        self.scheduler.pin();

        let idx = kind.index();
        NESTS.with(|nests| {
            let mut nests = nests.borrow_mut();
            let pos = match nests.iter().position(|n| n.engine == self.id) {
                Some(pos) => pos,
                None => {
                    nests.push(ReaderNest::new(self.id));
                    nests.len() - 1
                }
            };
            let nest = &mut nests[pos];

            assert!(nest.depth[idx] < u32::MAX, "read-side nesting overflow");
            nest.depth[idx] += 1;
            if nest.depth[idx] > 1 {
                return;
            }

            let domain = self.domain(kind);
            let worker = self.scheduler.current_worker();
            let record = domain.registered_record(worker);
            let slot = record.add_reader(self.scheduler.current_task());
            record.epoch.begin(&domain.epoch);

            nest.worker[idx] = worker;
            nest.slot[idx] = slot;
        });
    }

    /// Leaves a read-side critical section of `kind` on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not inside a section of `kind`.
    ///
    /// 在调用线程上离开 `kind` 的读侧临界区。
    pub(crate) fn read_unlock(&self, kind: RcuType) {
        if self.should_skip() {
            return;
        }

        let idx = kind.index();
        NESTS.with(|nests| {
            let mut nests = nests.borrow_mut();
            let pos = nests
                .iter()
                .position(|n| n.engine == self.id && n.depth[idx] > 0)
                .unwrap_or_else(|| {
                    panic!(
                        "read_unlock({}) without a matching read_lock",
                        kind.name()
                    )
                });
            let nest = &mut nests[pos];

            nest.depth[idx] -= 1;
            if nest.depth[idx] > 0 {
                return;
            }

            let record = self.domain(kind).record(nest.worker[idx]);
            record.epoch.end();
            record.remove_reader(nest.slot[idx]);

            if nest.is_idle() {
                nests.swap_remove(pos);
            }
        });

        self.scheduler.unpin();
    }

    /// Nesting depth of the calling thread in `kind`.
    pub(crate) fn read_depth(&self, kind: RcuType) -> u32 {
        NESTS.with(|nests| {
            nests
                .borrow()
                .iter()
                .find(|n| n.engine == self.id)
                .map_or(0, |n| n.depth[kind.index()])
        })
    }
}

/// A guard that keeps the current thread inside a read-side critical section.
///
/// Obtained from [`Rcu::read`] or [`Srcu::read`](crate::Srcu::read). The
/// section ends when the guard is dropped. Guards nest freely and are `!Send`
/// because the section is tied to the worker the thread was pinned on.
///
/// 保持当前线程处于读侧临界区内的守卫。
/// 守卫被 drop 时临界区结束。守卫可以自由嵌套，并且是 `!Send` 的，
/// 因为临界区与线程被钉住的工作者绑定。
#[must_use]
pub struct ReadGuard<'a> {
    rcu: &'a Rcu,
    kind: RcuType,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    pub(crate) fn new(rcu: &'a Rcu, kind: RcuType) -> Self {
        rcu.read_lock(kind);
        ReadGuard {
            rcu,
            kind,
            _not_send: PhantomData,
        }
    }

    /// Domain this guard protects.
    pub fn kind(&self) -> RcuType {
        self.kind
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.rcu.read_unlock(self.kind);
    }
}
