//! Event loop threads and the cross-thread dispatch primitive.
//!
//! Every server, client and UDP node is bound to one [`EventLoop`]. The loop
//! owns a dedicated OS thread running a single-threaded tokio runtime inside a
//! [`tokio::task::LocalSet`], so no two callbacks for handles on the same loop
//! ever run concurrently.
//!
//! Foreign threads talk to the loop only through [`LoopHandle::post`], which
//! enqueues a job on an unbounded channel. Jobs run exactly once, in FIFO
//! order per origin thread.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument as _;

use crate::info::ConnectionId;
use crate::notify;
use crate::Error;

mod receiver;
pub(crate) use self::receiver::Receiver;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How a possibly cross-thread operation was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// The caller was on the loop thread and the operation ran before returning.
    Direct,

    /// The operation was posted to the loop and will run later.
    Posted,
}

/// An event loop running on its own thread.
///
/// Dropping the loop stops it and joins the thread.
pub struct EventLoop {
    handle: LoopHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .finish()
    }
}

impl EventLoop {
    /// Start a new loop thread.
    pub fn new() -> io::Result<Self> {
        Self::with_name("switchyard-loop")
    }

    /// Start a new loop thread with the given thread name.
    pub fn with_name(name: &str) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = notify::channel();

        let shared = Arc::new(LoopShared {
            tx,
            alive: AtomicBool::new(true),
            thread: OnceLock::new(),
            stop: Mutex::new(stop_tx),
            receivers: Mutex::new(HashMap::new()),
        });

        let thread = thread::Builder::new().name(name.to_owned()).spawn({
            let shared = shared.clone();
            move || run(runtime, shared, rx, stop_rx)
        })?;

        Ok(Self {
            handle: LoopHandle { shared },
            thread: Mutex::new(Some(thread)),
        })
    }

    /// A cloneable handle to this loop.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Stop the loop. Jobs still queued are dropped without running.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stop the loop and wait for its thread to exit.
    pub fn join(&self) {
        self.handle.stop();
        if self.handle.is_loop_thread() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.join();
    }
}

fn run(
    runtime: tokio::runtime::Runtime,
    shared: Arc<LoopShared>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    stop: notify::Receiver,
) {
    let _ = shared.thread.set(thread::current().id());
    let span = tracing::debug_span!("event_loop", thread = ?thread::current().name());

    let local = tokio::task::LocalSet::new();
    local.block_on(
        &runtime,
        async move {
            tracing::trace!("event loop started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop.recv() => break,
                    job = rx.recv() => match job {
                        Some(job) => job(),
                        None => break,
                    },
                }
            }
            shared.alive.store(false, Ordering::Release);
            tracing::trace!("event loop stopped");
        }
        .instrument(span),
    );
}

struct LoopShared {
    tx: mpsc::UnboundedSender<Job>,
    alive: AtomicBool,
    thread: OnceLock<ThreadId>,
    stop: Mutex<notify::Sender>,
    receivers: Mutex<HashMap<ConnectionId, Arc<dyn Receiver>>>,
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("alive", &self.is_alive())
            .field("thread", &self.shared.thread.get())
            .finish()
    }
}

impl LoopHandle {
    /// Enqueue `job` to run on the loop thread.
    ///
    /// Fails with [`Error::Expired`] once the loop has been stopped; the job
    /// is dropped in that case.
    pub fn post<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_alive() {
            return Err(Error::Expired);
        }
        self.shared
            .tx
            .send(Box::new(job))
            .map_err(|_| Error::Expired)
    }

    /// Run `job` now if called on the loop thread, otherwise post it.
    pub fn run<F>(&self, job: F) -> Result<DispatchMode, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_loop_thread() {
            job();
            Ok(DispatchMode::Direct)
        } else {
            self.post(job).map(|_| DispatchMode::Posted)
        }
    }

    /// True when the caller is running on this loop's thread.
    pub fn is_loop_thread(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    /// False once the loop has been asked to stop.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Ask the loop to stop. Idempotent.
    pub fn stop(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            tracing::debug!("stopping event loop");
        }
        self.shared.stop.lock().send();
    }

    pub(crate) fn register(&self, id: ConnectionId, receiver: Arc<dyn Receiver>) {
        tracing::trace!(%id, "register receiver");
        self.shared.receivers.lock().insert(id, receiver);
    }

    pub(crate) fn unregister(&self, id: ConnectionId) -> Option<Arc<dyn Receiver>> {
        tracing::trace!(%id, "unregister receiver");
        self.shared.receivers.lock().remove(&id)
    }

    /// Look up the receiver for `id`. The table lock is released before the
    /// caller invokes anything on the receiver.
    pub(crate) fn receiver(&self, id: ConnectionId) -> Option<Arc<dyn Receiver>> {
        self.shared.receivers.lock().get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.shared.receivers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(LoopHandle: Send, Sync, Clone);
    assert_impl_all!(EventLoop: Send, Sync);

    #[test]
    fn posted_jobs_run_on_loop_thread_in_order() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle().clone();
        let (tx, rx) = std_mpsc::channel();

        for n in 0..16 {
            let tx = tx.clone();
            let inner = handle.clone();
            handle
                .post(move || {
                    assert!(inner.is_loop_thread());
                    tx.send(n).unwrap();
                })
                .unwrap();
        }

        let seen: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        assert!(!handle.is_loop_thread());
    }

    #[test]
    fn post_after_stop_is_expired() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle().clone();
        event_loop.join();

        let err = handle.post(|| {}).unwrap_err();
        assert!(matches!(err, Error::Expired));
        assert!(!handle.is_alive());
    }

    #[test]
    fn run_is_direct_on_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle().clone();
        let (tx, rx) = std_mpsc::channel();

        let inner = handle.clone();
        let mode = handle
            .run(move || {
                let mode = inner.run(|| {}).unwrap();
                tx.send(mode).unwrap();
            })
            .unwrap();

        assert_eq!(mode, DispatchMode::Posted);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DispatchMode::Direct
        );
    }

    #[test]
    fn jobs_can_spawn_local_tasks() {
        let event_loop = EventLoop::new().unwrap();
        let (tx, rx) = std_mpsc::channel();

        event_loop
            .handle()
            .post(move || {
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    tx.send(()).unwrap();
                });
            })
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
