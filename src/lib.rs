//! Epoch-based read-copy-update (RCU).
//!
//! Readers bracket their access to shared data with lock-free enter/exit
//! calls; writers publish a new version, then either wait for a grace period
//! ([`Rcu::synchronize`]) or hand the old version to a background drain
//! thread ([`Rcu::call_rcu`], [`Rcu::defer_drop`]) that destroys it once no
//! reader can still see it.
//!
//! # Architecture
//!
//! - Each engine has one domain per [`RcuType`]: a global epoch, one
//!   [`EpochRecord`](epoch::EpochRecord) per worker, and a FIFO callback queue.
//! - A thread entering its outermost section on a worker joins that worker's
//!   record; a grace period advances the epoch and waits until no record is
//!   active in an older epoch.
//! - While waiting, the synchronizer lets blocking readers run: it yields at
//!   their priority when they share its worker, and moves to their worker at
//!   the highest priority otherwise.
//! - Workers, pinning and priorities come from a [`Scheduler`];
//!   [`LogicalScheduler`] provides logical workers on any host.
//!
//! # Example
//! ```
//! use epoch_rcu::{Rcu, RcuType};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let rcu = Rcu::builder().workers(2).build().unwrap();
//!
//! {
//!     let _outer = rcu.read(RcuType::Regular);
//!     let _inner = rcu.read(RcuType::Regular);
//!     assert_eq!(rcu.read_depth(RcuType::Regular), 2);
//! }
//!
//! let ran = Arc::new(AtomicUsize::new(0));
//! let counter = ran.clone();
//! rcu.call_rcu(RcuType::Regular, move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! rcu.barrier(RcuType::Regular);
//! assert_eq!(ran.load(Ordering::SeqCst), 1);
//! ```
//!
//! 基于纪元的读-复制-更新 (RCU)。
//! 读者用无锁的进入/退出调用包围对共享数据的访问；写者发布新版本后，
//! 要么等待一个宽限期，要么把旧版本交给后台排空线程，在没有读者能看到它时销毁。

mod callback;
mod domain;
mod drain;
pub mod epoch;
mod reader;
mod sched;
mod slots;
mod srcu;
mod state;
mod sync;
mod synchronize;

pub use domain::{Rcu, RcuBuilder};
pub use reader::ReadGuard;
pub use sched::{LogicalScheduler, Priority, Scheduler, TaskId, WorkerId};
pub use srcu::{Srcu, SrcuKey};
pub use state::RcuType;

/// Errors returned while building an [`Rcu`] engine.
/// 构建 `Rcu` 引擎时返回的错误。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("an RCU engine needs at least one worker")]
    NoWorkers,
    #[error("requested {requested} workers but the scheduler provides {scheduler}")]
    WorkerCountMismatch { requested: usize, scheduler: usize },
    #[error("failed to spawn drain worker thread")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(all(test, not(feature = "loom")))]
mod tests;
