// Bucket layout follows the thread_local crate: bucket `i` holds `1 << i`
// entries, so buckets never move once published.

use std::{
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst},
};

const NUM_BUCKETS: usize = (usize::BITS - 1) as usize;

/// A growable array of reusable slots.
///
/// Slots are claimed with [`SlotArray::acquire`] and handed back with
/// [`SlotArray::release`]. Values are created once with `Default` and are
/// never dropped or moved until the array itself is dropped, so a `&T`
/// obtained from [`SlotArray::get`] stays valid even after the slot was
/// released and reclaimed by someone else.
///
/// 可复用槽位的可增长数组。
/// 值只在数组被 drop 时才被销毁，因此即使槽位被释放并被他人重新占用，
/// 从 `get` 获得的引用仍然有效。
pub(crate) struct SlotArray<T> {
    buckets: [AtomicPtr<Entry<T>>; NUM_BUCKETS],
    _marker: PhantomData<Box<Entry<T>>>,
}

struct Entry<T> {
    occupied: AtomicBool,
    value: T,
}

impl<T: Default> SlotArray<T> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            _marker: PhantomData,
        }
    }

    /// Claims a free slot, allocating a new bucket if every existing slot is
    /// taken. Returns the slot index.
    pub(crate) fn acquire(&self) -> usize {
        let mut index = 0;
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            let len = bucket_len(bucket_index);
            let entries = self.bucket_or_alloc(bucket, len);

            for entry_index in 0..len {
                // SAFETY: `entries` points to a live bucket of `len` entries.
                let entry = unsafe { &*entries.add(entry_index) };
                if entry
                    .occupied
                    .compare_exchange(false, true, SeqCst, SeqCst)
                    .is_ok()
                {
                    return index;
                }
                index += 1;
            }
        }

        unreachable!("too many slots")
    }

    fn bucket_or_alloc(&self, bucket: &AtomicPtr<Entry<T>>, len: usize) -> *mut Entry<T> {
        let current = bucket.load(SeqCst);
        if !current.is_null() {
            return current;
        }

        let new = alloc_bucket::<T>(len);
        match bucket.compare_exchange(ptr::null_mut(), new, SeqCst, SeqCst) {
            Ok(_) => new,
            Err(winner) => {
                // SAFETY: `new` was never published.
                unsafe { dealloc_bucket(new, len) };
                winner
            }
        }
    }
}

impl<T> SlotArray<T> {
    /// Marks the slot as free.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not occupied.
    pub(crate) fn release(&self, index: usize) {
        let was_occupied = self.entry(index).occupied.swap(false, SeqCst);
        assert!(was_occupied, "released slot {index} was not occupied");
    }

    /// Returns the value stored at `index`.
    ///
    /// # Panics
    ///
    /// Panics if no slot with this index was ever handed out.
    pub(crate) fn get(&self, index: usize) -> &T {
        &self.entry(index).value
    }

    /// Iterates over the occupied slots as `(index, value)` pairs.
    ///
    /// Slots may be released or claimed concurrently; the iterator only
    /// promises to visit every slot that stays occupied for its whole run.
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            array: self,
            bucket_index: 0,
            entry_index: 0,
        }
    }

    fn entry(&self, index: usize) -> &Entry<T> {
        let bucket_index = (usize::BITS - (index + 1).leading_zeros() - 1) as usize;
        let entries = self.buckets[bucket_index].load(SeqCst);
        assert!(!entries.is_null(), "slot {index} was never allocated");
        let entry_index = index - (bucket_len(bucket_index) - 1);
        // SAFETY: the bucket is live and `entry_index < bucket_len(bucket_index)`.
        unsafe { &*entries.add(entry_index) }
    }
}

impl<T: Default> Default for SlotArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SlotArray<T> {
    fn drop(&mut self) {
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            let ptr = *bucket.get_mut();
            if ptr.is_null() {
                continue;
            }
            // SAFETY: every non-null bucket was produced by `alloc_bucket(bucket_len(i))`.
            unsafe { dealloc_bucket(ptr, bucket_len(i)) };
        }
    }
}

fn alloc_bucket<T: Default>(len: usize) -> *mut Entry<T> {
    let entries: Box<[Entry<T>]> = (0..len)
        .map(|_| Entry {
            occupied: AtomicBool::new(false),
            value: T::default(),
        })
        .collect();
    Box::into_raw(entries).cast()
}

unsafe fn dealloc_bucket<T>(ptr: *mut Entry<T>, len: usize) {
    unsafe {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)));
    }
}

const fn bucket_len(bucket_index: usize) -> usize {
    1 << bucket_index
}

pub(crate) struct Iter<'a, T> {
    array: &'a SlotArray<T>,
    bucket_index: usize,
    entry_index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket_index < NUM_BUCKETS {
            let entries = self.array.buckets[self.bucket_index].load(SeqCst);
            if entries.is_null() {
                return None;
            }

            let len = bucket_len(self.bucket_index);
            while self.entry_index < len {
                // SAFETY: `entries` is a live bucket of `len` entries.
                let entry = unsafe { &*entries.add(self.entry_index) };
                let index = len - 1 + self.entry_index;
                self.entry_index += 1;
                if entry.occupied.load(SeqCst) {
                    return Some((index, &entry.value));
                }
            }

            self.bucket_index += 1;
            self.entry_index = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::SlotArray;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    #[test]
    fn acquire_reuses_released_slots() {
        let array = SlotArray::<AtomicUsize>::new();
        let a = array.acquire();
        let b = array.acquire();
        assert_ne!(a, b);

        array.release(a);
        assert_eq!(array.acquire(), a);
        assert!(array.iter().any(|(i, _)| i == b));
    }

    #[test]
    fn values_survive_release() {
        let array = SlotArray::<AtomicUsize>::new();
        let index = array.acquire();
        array.get(index).store(7, SeqCst);
        array.release(index);
        assert_eq!(array.get(index).load(SeqCst), 7);
    }

    #[test]
    fn grows_across_buckets() {
        let array = SlotArray::<AtomicUsize>::new();
        let indices: Vec<_> = (0..40).map(|_| array.acquire()).collect();
        assert_eq!(indices, (0..40).collect::<Vec<_>>());

        for &i in &indices {
            array.get(i).store(i, SeqCst);
        }
        for &i in &indices {
            assert_eq!(array.get(i).load(SeqCst), i);
        }
    }

    #[test]
    fn iter_skips_free_slots() {
        let array = SlotArray::<AtomicUsize>::new();
        let a = array.acquire();
        let b = array.acquire();
        let c = array.acquire();
        array.release(b);

        let seen: Vec<_> = array.iter().map(|(i, _)| i).collect();
        assert_eq!(seen, vec![a, c]);
    }

    #[test]
    #[should_panic = "was not occupied"]
    fn double_release() {
        let array = SlotArray::<AtomicUsize>::new();
        let a = array.acquire();
        array.release(a);
        array.release(a);
    }

    #[test]
    fn concurrent_acquire_is_unique() {
        let array = SlotArray::<AtomicUsize>::new();
        let array = &array;
        let mut all: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(move || (0..64).map(|_| array.acquire()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 256);
    }
}
