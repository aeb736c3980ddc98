//! Sleepable RCU.
//!
//! [`Srcu`] routes every call to the [`RcuType::Sleepable`] domain of an
//! engine. Read-side sections of this domain may block; its grace periods
//! never wait for readers of the regular domain and vice versa.
//!
//! All `Srcu` handles of one engine share the same domain, so a grace period
//! started through any of them waits for the readers of all of them.
//!
//! 可睡眠 RCU。
//! `Srcu` 将所有调用路由到引擎的 `RcuType::Sleepable` 域。该域的读侧临界区可以阻塞；
//! 它的宽限期从不等待常规域的读者，反之亦然。
//! 同一引擎的所有 `Srcu` 句柄共享同一个域。

use crate::domain::Rcu;
use crate::reader::ReadGuard;
use crate::state::RcuType;

const KIND: RcuType = RcuType::Sleepable;

/// Token returned by [`Srcu::read_lock`], handed back to [`Srcu::read_unlock`].
///
/// Carries the nesting depth reached by the matching `read_lock`.
///
/// `Srcu::read_lock` 返回的令牌，交还给 `Srcu::read_unlock`。
#[must_use = "pass the key to Srcu::read_unlock"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcuKey(u32);

impl SrcuKey {
    /// Nesting depth right after the matching `read_lock`.
    pub fn depth(self) -> u32 {
        self.0
    }
}

/// A sleepable-RCU handle.
///
/// # Example
/// ```
/// use epoch_rcu::Rcu;
///
/// let rcu = Rcu::builder().workers(2).build().unwrap();
/// let srcu = rcu.srcu();
///
/// let key = srcu.read_lock();
/// std::thread::sleep(std::time::Duration::from_millis(1));
/// srcu.read_unlock(key);
///
/// srcu.synchronize();
/// srcu.cleanup();
/// ```
///
/// 可睡眠 RCU 句柄。
#[derive(Clone)]
pub struct Srcu {
    rcu: Rcu,
}

impl Srcu {
    /// Create a handle on `rcu`'s sleepable domain. The domain already exists,
    /// so nothing is allocated.
    pub fn new(rcu: &Rcu) -> Self {
        Self { rcu: rcu.clone() }
    }

    /// Release the handle. Callbacks already queued still run.
    pub fn cleanup(self) {}

    pub fn read_lock(&self) -> SrcuKey {
        self.rcu.read_lock(KIND);
        SrcuKey(self.rcu.read_depth(KIND))
    }

    /// Keys must be released innermost first.
    ///
    /// # Panics
    ///
    /// Panics without a matching [`read_lock`](Self::read_lock) on this thread.
    /// Debug builds also panic when `key` is not the innermost open section.
    pub fn read_unlock(&self, key: SrcuKey) {
        // Keys taken while the scheduler is halted carry depth 0.
        debug_assert!(
            key.depth() == 0 || key.depth() == self.rcu.read_depth(KIND),
            "srcu keys released out of order"
        );
        self.rcu.read_unlock(KIND);
    }

    #[inline]
    pub fn read(&self) -> ReadGuard<'_> {
        self.rcu.read(KIND)
    }

    /// See [`Rcu::synchronize`].
    pub fn synchronize(&self) {
        self.rcu.synchronize(KIND);
    }

    /// See [`Rcu::barrier`].
    pub fn barrier(&self) {
        self.rcu.barrier(KIND);
    }

    /// See [`Rcu::call_rcu`].
    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.rcu.call_rcu(KIND, f);
    }

    /// The engine this handle belongs to.
    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }
}
