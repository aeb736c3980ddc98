//! Low-level epoch primitive shared by every RCU domain.
//!
//! An [`EpochCounter`] is the global clock of one domain, and each worker owns
//! an [`EpochRecord`]. Readers call [`EpochRecord::begin`] / [`EpochRecord::end`]
//! (lock-free); a grace period advances the counter and waits until no record
//! is still active in an older epoch.
//!
//! 所有 RCU 域共享的底层纪元原语。
//! `EpochCounter` 是一个域的全局时钟，每个工作者拥有一个 `EpochRecord`。
//! 读者调用 `begin` / `end`（无锁）；宽限期推进计数器，
//! 并等待直到没有记录仍活跃在更旧的纪元中。

use crate::sync::{AtomicU32, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

const ACTIVE_MASK: u64 = u32::MAX as u64;
const EPOCH_SHIFT: u32 = 32;

#[inline]
const fn pack(epoch: u32, active: u32) -> u64 {
    ((epoch as u64) << EPOCH_SHIFT) | active as u64
}

#[inline]
const fn unpack(word: u64) -> RecordSnapshot {
    RecordSnapshot {
        epoch: (word >> EPOCH_SHIFT) as u32,
        active: (word & ACTIVE_MASK) as u32,
    }
}

/// Returns `true` if epoch `a` is strictly older than epoch `b`.
///
/// Epochs wrap around, so the comparison uses the wrapping distance.
///
/// 如果纪元 `a` 严格早于纪元 `b`，返回 `true`。纪元会回绕，因此使用回绕距离比较。
#[inline]
pub const fn is_before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// The global epoch clock of a domain.
///
/// 一个域的全局纪元时钟。
#[derive(Debug)]
pub struct EpochCounter {
    global: CachePadded<AtomicU32>,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self {
            global: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Current value of the global epoch.
    /// 全局纪元的当前值。
    #[inline]
    pub fn current(&self) -> u32 {
        self.global.load(Ordering::Acquire)
    }

    /// Advances the global epoch by one and returns the new value.
    ///
    /// Every reader that begins after observing the returned value also
    /// observes every write made before this call.
    ///
    /// 将全局纪元推进一步并返回新值。
    /// 在观察到返回值之后开始的每个读者，也能观察到此调用之前的所有写入。
    #[inline]
    pub fn advance(&self) -> u32 {
        self.global.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl Default for EpochCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded state of an [`EpochRecord`].
/// `EpochRecord` 解码后的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSnapshot {
    /// Epoch the record's readers entered in; meaningless while `active == 0`.
    pub epoch: u32,
    /// Number of outermost read-side sections currently open on the record.
    pub active: u32,
}

impl RecordSnapshot {
    /// Whether this record still holds readers from before `target`.
    /// 此记录是否仍持有 `target` 之前的读者。
    #[inline]
    pub fn blocks(&self, target: u32) -> bool {
        self.active != 0 && is_before(self.epoch, target)
    }
}

/// Per-worker participation record.
///
/// The epoch and the count of active readers live in one word so that a
/// reader joining an already-active record inherits the record's epoch in the
/// same atomic step. A record's epoch can therefore only be older than the
/// epoch any of its readers observed, never newer.
///
/// 每个工作者的参与记录。
/// 纪元与活跃读者数存放在同一个字中，因此加入已活跃记录的读者
/// 会在同一个原子步骤中继承该记录的纪元。记录的纪元只可能比其读者观察到的更旧，不会更新。
#[derive(Debug)]
pub struct EpochRecord {
    state: CachePadded<AtomicU64>,
}

impl EpochRecord {
    pub fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Enters a read-side section on this record.
    ///
    /// # Panics
    ///
    /// Panics if `u32::MAX` sections are already open on the record.
    ///
    /// 在此记录上进入读侧临界区。
    #[inline]
    pub fn begin(&self, counter: &EpochCounter) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let snapshot = unpack(current);
            let next = match snapshot.active {
                0 => pack(counter.current(), 1),
                u32::MAX => panic!("too many readers on one epoch record"),
                active => pack(snapshot.epoch, active + 1),
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Leaves a read-side section on this record.
    ///
    /// # Panics
    ///
    /// Panics if no section is open.
    ///
    /// 离开此记录上的读侧临界区。
    #[inline]
    pub fn end(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        assert!(
            unpack(prev).active > 0,
            "BUG: EpochRecord::end without a matching begin"
        );
    }

    /// Relaxed view of the record, for diagnostics only.
    /// 记录的宽松视图，仅用于诊断。
    #[inline]
    pub fn snapshot(&self) -> RecordSnapshot {
        unpack(self.state.load(Ordering::Relaxed))
    }

    /// View of the record used by grace periods.
    ///
    /// This is a read-modify-write so it observes the latest value in the
    /// word's modification order, and synchronizes with the `end` of every
    /// reader it no longer sees.
    ///
    /// 宽限期使用的记录视图。
    /// 这是一次读-改-写操作，因此能观察到修改顺序中的最新值，
    /// 并与它不再看到的每个读者的 `end` 同步。
    #[inline]
    pub fn synchronized_snapshot(&self) -> RecordSnapshot {
        unpack(self.state.fetch_add(0, Ordering::AcqRel))
    }

    /// Whether this record holds readers that entered before `target`.
    /// 此记录是否持有在 `target` 之前进入的读者。
    #[inline]
    pub fn is_blocking(&self, target: u32) -> bool {
        self.synchronized_snapshot().blocks(target)
    }
}

impl Default for EpochRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn wrapping_order() {
        assert!(is_before(1, 2));
        assert!(!is_before(2, 2));
        assert!(!is_before(3, 2));
        assert!(is_before(u32::MAX, 0));
        assert!(!is_before(0, u32::MAX));
    }

    #[test]
    fn first_reader_snapshots_global_epoch() {
        let counter = EpochCounter::new();
        counter.advance();
        counter.advance();

        let record = EpochRecord::new();
        record.begin(&counter);
        assert_eq!(record.snapshot(), RecordSnapshot { epoch: 2, active: 1 });

        record.end();
        assert_eq!(record.snapshot().active, 0);
    }

    #[test]
    fn joining_reader_inherits_record_epoch() {
        let counter = EpochCounter::new();
        let record = EpochRecord::new();

        record.begin(&counter);
        let target = counter.advance();
        record.begin(&counter);

        let snapshot = record.snapshot();
        assert_eq!(snapshot, RecordSnapshot { epoch: 0, active: 2 });
        assert!(record.is_blocking(target));

        record.end();
        assert!(record.is_blocking(target));
        record.end();
        assert!(!record.is_blocking(target));
    }

    #[test]
    fn reader_after_advance_does_not_block() {
        let counter = EpochCounter::new();
        let record = EpochRecord::new();

        let target = counter.advance();
        record.begin(&counter);
        assert!(!record.is_blocking(target));
        record.end();
    }

    #[test]
    fn newer_epochs_do_not_block_older_targets() {
        let counter = EpochCounter::new();
        let record = EpochRecord::new();

        let older = counter.advance();
        counter.advance();
        record.begin(&counter);
        assert!(!record.is_blocking(older));
        record.end();
    }

    #[test]
    #[should_panic = "without a matching begin"]
    fn unbalanced_end() {
        EpochRecord::new().end();
    }
}
