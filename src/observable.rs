//! Cancellable producers backing subscription procedures.
//!
//! A subscription procedure returns an [`Observable`]. When the dispatcher
//! subscribes to it the producer receives an [`Emitter`] and hands back an
//! [`Unsubscribe`] that releases whatever the stream holds. A stream is not
//! restartable, a new subscription needs a new invocation.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::errors::{BoxError, RpcError};

/// Release of a stream's resources, called at most once.
pub type Unsubscribe = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

type SubscribeFn = Box<dyn FnOnce(Emitter) -> Result<Unsubscribe, BoxError> + Send>;

/// Receiver of stream events.
pub trait StreamSink: Send + Sync {
    fn data(&self, value: Value);
    fn error(&self, err: RpcError);
    fn complete(&self);
    /// false once the consumer no longer wants values
    fn is_active(&self) -> bool;
}

/// Push side of a subscription.
///
/// Cheap to clone; the first of `error`/`complete` ends the stream and every
/// later call is ignored.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn StreamSink>,
    done: Arc<AtomicBool>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Emitter {
    pub fn new(sink: Arc<dyn StreamSink>) -> Self {
        Emitter {
            sink,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit one value, returns false if the stream is closed.
    pub fn next<T: Serialize>(&self, value: T) -> bool {
        if self.is_closed() {
            return false;
        }
        match serde_json::to_value(value) {
            Ok(value) => {
                self.sink.data(value);
                true
            }
            Err(e) => {
                self.error(RpcError::internal(format!(
                    "failed to serialize stream item: {e}"
                )));
                false
            }
        }
    }

    /// End the stream with an error.
    pub fn error(&self, err: impl Into<BoxError>) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.sink.error(RpcError::normalize(err.into()));
        }
    }

    /// End the stream normally.
    pub fn complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.sink.complete();
        }
    }

    /// true after the stream ended or the consumer went away
    pub fn is_closed(&self) -> bool {
        self.done.load(Ordering::Acquire) || !self.sink.is_active()
    }
}

/// A lazy, cancellable stream of values.
pub struct Observable {
    subscribe: SubscribeFn,
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observable")
    }
}

impl Observable {
    /// Create a stream from its subscribe function.
    ///
    /// The function starts producing (typically in a coroutine of its own)
    /// and returns how to stop.
    pub fn new<F>(subscribe: F) -> Self
    where
        F: FnOnce(Emitter) -> Result<Unsubscribe, BoxError> + Send + 'static,
    {
        Observable {
            subscribe: Box::new(subscribe),
        }
    }

    /// Emit every item, then complete.
    pub fn from_iter<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Send + 'static,
        T: Serialize,
    {
        Observable::new(move |emitter| {
            for item in items {
                if !emitter.next(item) {
                    break;
                }
            }
            emitter.complete();
            Ok(Box::new(|| Ok(())) as Unsubscribe)
        })
    }

    /// Start the stream.
    pub fn subscribe(self, emitter: Emitter) -> Result<Unsubscribe, BoxError> {
        (self.subscribe)(emitter)
    }
}
