use crate::state::{RcuType, SharedState};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use tracing::{debug, error};

/// Text of a panic payload, for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// An object that has been removed from shared view but not yet destroyed.
///
/// It stores the raw pointer to its container and a destructor that restores
/// the concrete `Box<T>`.
///
/// 一个已从共享视图中移除但尚未销毁的对象。
/// 它存储指向容器的原始指针，以及恢复具体 `Box<T>` 的析构函数。
pub(crate) struct RetiredObject {
    ptr: *mut (),
    dtor: unsafe fn(*mut ()),
}

// SAFETY: only constructed from `Box<T>` with `T: Send`.
unsafe impl Send for RetiredObject {}

#[inline(always)]
unsafe fn drop_value<T>(ptr: *mut ()) {
    unsafe {
        drop(Box::from_raw(ptr.cast::<T>()));
    }
}

impl RetiredObject {
    pub(crate) fn new<T: Send + 'static>(value: Box<T>) -> Self {
        RetiredObject {
            ptr: Box::into_raw(value).cast(),
            dtor: drop_value::<T>,
        }
    }

    /// Locates the `Box<T>` that embeds `field` at byte `offset`.
    ///
    /// # Safety
    ///
    /// `field` must point `offset` bytes into a live `T` allocated with
    /// `Box<T>` that nobody else will free.
    pub(crate) unsafe fn from_field<T: Send + 'static>(field: NonNull<u8>, offset: usize) -> Self {
        assert!(
            offset < std::mem::size_of::<T>().max(1),
            "offset {offset} lies outside a container of {} bytes",
            std::mem::size_of::<T>()
        );
        RetiredObject {
            ptr: field.as_ptr().wrapping_sub(offset).cast(),
            dtor: drop_value::<T>,
        }
    }

    fn destroy(self) {
        let Self { ptr, dtor } = self;
        // SAFETY: `ptr` came from `Box::into_raw` of the type `dtor` was instantiated with.
        unsafe { dtor(ptr) }
    }
}

/// A queued reclamation request.
/// 一个排队中的回收请求。
pub(crate) enum Callback {
    /// Destroy a retired container.
    Free(RetiredObject),
    /// Run an arbitrary completion routine.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Callback {
    fn invoke(self) {
        match self {
            Callback::Free(object) => object.destroy(),
            Callback::Call(f) => f(),
        }
    }
}

impl SharedState {
    /// Appends `callback` to the queue of `kind`.
    pub(crate) fn enqueue_callback(&self, kind: RcuType, callback: Callback) {
        self.domain(kind).callbacks.lock().push_back(callback);
    }

    pub(crate) fn pending_callbacks(&self, kind: RcuType) -> usize {
        self.domain(kind).callbacks.lock().len()
    }

    /// One drain pass: detach the queue, wait for one grace period, then run
    /// the batch in enqueue order.
    ///
    /// Runs on the drain worker of `kind` only.
    ///
    /// 一次排空：分离队列，等待一个宽限期，然后按入队顺序执行这批回调。
    pub(crate) fn run_callbacks(&self, kind: RcuType) {
        let batch = std::mem::take(&mut *self.domain(kind).callbacks.lock());
        if batch.is_empty() {
            return;
        }

        self.synchronize(kind);

        debug!(domain = kind.name(), callbacks = batch.len(), "running deferred callbacks");
        for callback in batch {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback.invoke())) {
                error!(
                    domain = kind.name(),
                    panic = panic_message(&*payload),
                    "deferred callback panicked"
                );
            }
        }
    }
}
