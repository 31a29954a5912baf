//! Lifecycle events and the subscriber table they are dispatched to.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tonic::Status;
use tracing::{trace, warn};

use crate::grpc::CallContext;

/// Error type subscribers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber callback.
pub type Receiver = Arc<dyn Fn(&LifecycleEvent<'_>) -> Result<(), BoxError> + Send + Sync>;

/// The three lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Fired before the handler runs
    RequestStarted,
    /// Fired after the handler returned, or its stream ended, successfully
    RequestFinished,
    /// Fired once when the handler or its stream fails
    RequestFailed,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::RequestStarted => "request_started",
            Signal::RequestFinished => "request_finished",
            Signal::RequestFailed => "request_failed",
        };
        f.write_str(name)
    }
}

/// The call an event describes.
#[derive(Clone, Copy)]
pub struct RequestInfo<'a> {
    message: &'a (dyn Any + Send + Sync),
    context: &'a CallContext,
}

impl<'a> RequestInfo<'a> {
    /// Describe a call by its request message and context.
    pub fn new(message: &'a (dyn Any + Send + Sync), context: &'a CallContext) -> Self {
        Self { message, context }
    }

    /// The request message, if it is a `T`.
    pub fn message<T: Any>(&self) -> Option<&'a T> {
        self.message.downcast_ref::<T>()
    }

    /// Context of the call, including any recorded abort.
    pub fn context(&self) -> &'a CallContext {
        self.context
    }

    /// Full method path, e.g. `/helloworld.Greeter/SayHello`.
    pub fn method(&self) -> &'a str {
        self.context.method()
    }
}

impl fmt::Debug for RequestInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInfo")
            .field("method", &self.method())
            .finish_non_exhaustive()
    }
}

/// A lifecycle notification for one call.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleEvent<'a> {
    /// The handler is about to run
    Started(RequestInfo<'a>),
    /// The handler succeeded and any response stream is exhausted
    Finished(RequestInfo<'a>),
    /// The handler or its stream returned an error
    Failed {
        request: RequestInfo<'a>,
        /// Status returned to the client
        error: &'a Status,
    },
}

impl<'a> LifecycleEvent<'a> {
    /// Which signal this event belongs to.
    pub fn signal(&self) -> Signal {
        match self {
            LifecycleEvent::Started(_) => Signal::RequestStarted,
            LifecycleEvent::Finished(_) => Signal::RequestFinished,
            LifecycleEvent::Failed { .. } => Signal::RequestFailed,
        }
    }

    /// The call this event describes.
    pub fn request(&self) -> &RequestInfo<'a> {
        match self {
            LifecycleEvent::Started(request)
            | LifecycleEvent::Finished(request)
            | LifecycleEvent::Failed { request, .. } => request,
        }
    }

    /// The handler error, for failure events.
    pub fn error(&self) -> Option<&'a Status> {
        match self {
            LifecycleEvent::Failed { error, .. } => Some(*error),
            _ => None,
        }
    }
}

/// Subscriber lists per signal.
///
/// Receivers are connected at start-up. Dispatch is synchronous and in
/// connection order; a receiver that fails or panics is logged and skipped,
/// it never affects the call being described.
#[derive(Default)]
pub struct SignalBus {
    started: RwLock<Vec<Receiver>>,
    finished: RwLock<Vec<Receiver>>,
    failed: RwLock<Vec<Receiver>>,
}

impl SignalBus {
    /// Create a bus with no receivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus used by interceptors that are not given one.
    pub fn global() -> Arc<SignalBus> {
        static GLOBAL: OnceLock<Arc<SignalBus>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SignalBus::new())))
    }

    fn receivers(&self, signal: Signal) -> &RwLock<Vec<Receiver>> {
        match signal {
            Signal::RequestStarted => &self.started,
            Signal::RequestFinished => &self.finished,
            Signal::RequestFailed => &self.failed,
        }
    }

    /// Subscribe `receiver` to `signal`.
    pub fn connect<F>(&self, signal: Signal, receiver: F)
    where
        F: Fn(&LifecycleEvent<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.receivers(signal).write().push(Arc::new(receiver));
    }

    /// Number of receivers subscribed to `signal`.
    pub fn receiver_count(&self, signal: Signal) -> usize {
        self.receivers(signal).read().len()
    }

    /// Remove every receiver of every signal.
    pub fn disconnect_all(&self) {
        self.started.write().clear();
        self.finished.write().clear();
        self.failed.write().clear();
    }

    /// Deliver `event` to every receiver of its signal.
    pub fn send(&self, event: &LifecycleEvent<'_>) {
        let signal = event.signal();
        let receivers = self.receivers(signal).read().clone();
        if receivers.is_empty() {
            return;
        }

        let method = event.request().method();
        trace!(signal = %signal, method = %method, receivers = receivers.len(), "Sending signal");

        for receiver in receivers {
            match catch_unwind(AssertUnwindSafe(|| receiver(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(signal = %signal, method = %method, error = %e, "Signal receiver failed");
                }
                Err(_) => {
                    warn!(signal = %signal, method = %method, "Signal receiver panicked");
                }
            }
        }
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBus")
            .field("started", &self.started.read().len())
            .field("finished", &self.finished.read().len())
            .field("failed", &self.failed.read().len())
            .finish()
    }
}
