mod concurrent_tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 在 drop 时递增共享计数器的测试值
pub(crate) struct DropCounter {
    pub(crate) drops: Arc<AtomicUsize>,
}

impl DropCounter {
    pub(crate) fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            drops: drops.clone(),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
