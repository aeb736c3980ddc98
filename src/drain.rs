//! Coalescing background worker that runs a domain's deferred callbacks.
//!
//! Requests are counted with tickets: `enqueue` takes a ticket, a pass that
//! starts after a ticket was taken covers it, and `drain` waits for the ticket
//! current at call time. Later requests never extend a `drain` that is
//! already waiting.
//!
//! 合并请求的后台工作者，负责运行一个域的延迟回调。
//! 请求以票号计数：`enqueue` 领取一张票，在领票之后开始的一次执行会覆盖它，
//! `drain` 等待调用时的票号完成。之后的请求不会延长一个已在等待的 `drain`。

use crate::callback::panic_message;
use crate::sync::{Arc, Condvar, Mutex};
use std::io;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::error;

#[derive(Debug, Default)]
struct DrainState {
    requested: u64,
    completed: u64,
    shutdown: bool,
}

struct DrainShared {
    state: Mutex<DrainState>,
    condvar: Condvar,
}

pub(crate) struct DrainTask {
    shared: Arc<DrainShared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DrainTask {
    /// Spawns the worker thread; `pass` is called once per coalesced batch of requests.
    pub(crate) fn spawn<F>(name: String, mut pass: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(DrainShared {
            state: Mutex::new(DrainState::default()),
            condvar: Condvar::new(),
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new().name(name).spawn(move || {
                let mut state = shared.state.lock();
                loop {
                    while state.requested == state.completed && !state.shutdown {
                        state = shared.condvar.wait(state);
                    }
                    if state.requested == state.completed {
                        break;
                    }

                    let ticket = state.requested;
                    drop(state);
                    pass();
                    state = shared.state.lock();
                    state.completed = ticket;
                    shared.condvar.notify_all();
                }
            })?
        };

        Ok(Self {
            shared,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Asks the worker to run at least once more.
    pub(crate) fn enqueue(&self) {
        let mut state = self.shared.state.lock();
        state.requested += 1;
        self.shared.condvar.notify_all();
    }

    /// Blocks until every pass requested before this call has finished.
    ///
    /// # Panics
    ///
    /// Panics when called from the worker thread itself.
    pub(crate) fn drain(&self) {
        assert!(
            !self.is_worker_thread(),
            "cannot wait for the drain worker from one of its own callbacks"
        );
        let mut state = self.shared.state.lock();
        let target = state.requested;
        while state.completed < target {
            state = self.shared.condvar.wait(state);
        }
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for DrainTask {
    /// Stops the worker after it has served every outstanding request.
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.condvar.notify_all();

        let Some(thread) = self.thread.take() else {
            return;
        };
        // Dropped from inside a pass: the worker exits on its own once the pass returns.
        if self.is_worker_thread() {
            return;
        }
        let name = thread.thread().name().unwrap_or("drain").to_owned();
        if let Err(payload) = thread.join() {
            error!(thread = %name, panic = panic_message(&*payload), "drain worker panicked");
        }
    }
}
