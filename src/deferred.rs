//! Background jobs and cooperative cancellation.
//!
//! Large sample blocks are decoded off the parsing thread. The parse keeps going while the job
//! runs, and a job that fails or panics only makes its own value unavailable: the failure is
//! logged and handed to whoever asks for the value, never to the document read.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use futures_core::future::FusedFuture;
use parking_lot::{Condvar, Mutex};

use crate::cursor::Reader;
use crate::error::{Error, Result};

/// Cooperative cancellation flag, checked between top-level chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

type Outcome<T> = std::result::Result<Arc<T>, String>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    waker: Option<Waker>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    fn complete(&self, outcome: Outcome<T>) {
        let waker = {
            let mut state = self.state.lock();
            state.outcome = Some(outcome);
            state.waker.take()
        };
        self.done.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// A value computed on a background thread.
///
/// Block on it with [`wait`][Deferred::wait], or `.await` it: it implements [`Future`] and never
/// needs a particular executor.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
    label: Arc<str>,
    terminated: bool,
}

impl<T: Send + Sync + 'static> Deferred<T> {
    /// Run `job` on a new thread.
    pub fn spawn<F>(label: &str, job: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let deferred = Self::pending(label);
        let shared = Arc::clone(&deferred.shared);
        let worker_label = Arc::clone(&deferred.label);
        let spawned = thread::Builder::new()
            .name(format!("gbx-{}", label))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(value)) => Ok(Arc::new(value)),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(payload) => Err(panic_message(payload.as_ref())),
                };
                if let Err(message) = &outcome {
                    tracing::warn!(job = %worker_label, %message, "background job failed");
                }
                shared.complete(outcome);
            });
        if let Err(err) = spawned {
            tracing::warn!(job = label, %err, "couldn't start background job");
            deferred.shared.complete(Err(err.to_string()));
        }
        deferred
    }
}

impl<T: Send + Sync + 'static> Deferred<Vec<T>> {
    /// Decode `block` as back-to-back records of `stride` bytes in the background.
    pub fn decode_records<F>(label: &str, block: Vec<u8>, stride: usize, decode: F) -> Self
    where
        F: Fn(&mut Reader<'_>) -> Result<T> + Send + 'static,
    {
        Self::spawn(label, move || {
            if stride == 0 || block.len() % stride != 0 {
                return Err(Error::malformed(
                    0,
                    format!("{} bytes is not a whole number of {}-byte records", block.len(), stride),
                ));
            }
            let mut out = Vec::with_capacity(block.len() / stride);
            for (i, record) in block.chunks_exact(stride).enumerate() {
                let mut r = Reader::with_base(record, i * stride);
                out.push(decode(&mut r)?);
                if !r.is_empty() {
                    return Err(Error::malformed(r.offset(), "record decoder left bytes unread"));
                }
            }
            Ok(out)
        })
    }
}

impl<T> Deferred<T> {
    fn pending(label: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    waker: None,
                }),
                done: Condvar::new(),
            }),
            label: Arc::from(label),
            terminated: false,
        }
    }

    /// An already-available value.
    pub fn ready(label: &str, value: T) -> Self {
        let deferred = Self::pending(label);
        deferred.shared.complete(Ok(Arc::new(value)));
        deferred
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    fn resolve(&self, outcome: &Outcome<T>) -> Result<Arc<T>> {
        outcome.clone().map_err(|message| Error::Deferred {
            label: self.label.to_string(),
            message,
        })
    }

    /// The result, if the job has finished.
    pub fn try_get(&self) -> Option<Result<Arc<T>>> {
        let state = self.shared.state.lock();
        state.outcome.as_ref().map(|o| self.resolve(o))
    }

    /// Block until the job finishes.
    pub fn wait(&self) -> Result<Arc<T>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return self.resolve(outcome);
            }
            self.shared.done.wait(&mut state);
        }
    }

    /// Block until the job finishes and take the value out. Fails if a handle returned by
    /// [`wait`][Self::wait] is still alive.
    pub fn wait_owned(self) -> Result<T> {
        let value = self.wait()?;
        // Drop the copy held in the shared state so ours is the last one.
        self.shared.state.lock().outcome = None;
        Arc::try_unwrap(value).map_err(|_| Error::Deferred {
            label: self.label.to_string(),
            message: "value is still shared".into(),
        })
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<Arc<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();
        match &state.outcome {
            Some(outcome) => {
                let result = this.resolve(outcome);
                drop(state);
                this.terminated = true;
                Poll::Ready(result)
            }
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> FusedFuture for Deferred<T> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("label", &self.label)
            .field("done", &self.is_done())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".into()
    }
}
