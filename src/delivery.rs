//! Hands lifecycle callbacks to the delivery context.
//!
//! # Overview
//!
//! Workers never call a [`Listener`](crate::Listener) directly. They post
//! closures to a [`Delivery`], whose [`Executor`] decides where the closures
//! run. The default executor is a channel drained in order by one task, the
//! [`DeliveryLoop`], so every callback runs on that single context and two
//! deliveries for the same request are observed in the order they were
//! posted.
//!
//! # Example
//!
//! ```
//! use fetchq_core::Delivery;
//!
//! # async fn example() {
//! let (delivery, delivery_loop) = Delivery::channel();
//! let handle = tokio::spawn(delivery_loop.run());
//! delivery.post(Box::new(|| println!("on the delivery context")));
//! drop(delivery);
//! handle.await.ok();
//! # }
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::Dispatch;
use crate::error::{RequestError, panic_message};
use crate::listener::Signal;
use crate::request::{Request, Response};

/// A unit of work for the delivery context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs delivery tasks.
pub trait Executor: Send + Sync {
    /// Schedules `task`. Tasks from one executor must run in submission order.
    fn execute(&self, task: Task);
}

/// Runs every task inline on the posting worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn execute(&self, task: Task) {
        run_task(task);
    }
}

/// Sends tasks to a [`DeliveryLoop`].
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    tx: mpsc::UnboundedSender<Task>,
}

impl Executor for ChannelExecutor {
    fn execute(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("delivery loop stopped; dropping callback");
        }
    }
}

/// The single delivery context: drains posted tasks in order.
#[derive(Debug)]
pub struct DeliveryLoop {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl DeliveryLoop {
    /// Runs tasks until every [`Delivery`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            run_task(task);
        }
    }

    /// Runs tasks until `shutdown` fires, then drains what is already queued.
    pub async fn run_until(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                task = self.rx.recv() => match task {
                    Some(task) => run_task(task),
                    None => return,
                },
                () = shutdown.cancelled() => break,
            }
        }
        while let Ok(task) = self.rx.try_recv() {
            run_task(task);
        }
    }
}

/// A listener callback that panics must not take the delivery context down.
fn run_task(task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        warn!(panic = %panic_message(payload.as_ref()), "listener callback panicked");
    }
}

/// Posts lifecycle events to an [`Executor`].
#[derive(Clone)]
pub struct Delivery {
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").finish_non_exhaustive()
    }
}

impl Delivery {
    /// Wraps a custom executor.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Delivers on the posting worker.
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(Arc::new(ImmediateExecutor))
    }

    /// Creates a channel-backed delivery and the loop that drains it.
    #[must_use]
    pub fn channel() -> (Self, DeliveryLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Arc::new(ChannelExecutor { tx })), DeliveryLoop { rx })
    }

    /// Runs an arbitrary task on the delivery context.
    pub fn post(&self, task: Task) {
        self.executor.execute(task);
    }

    fn post_signal(&self, request: &Arc<dyn Dispatch>, signal: Signal) {
        let request = Arc::clone(request);
        self.post(Box::new(move || request.notify(signal)));
    }

    pub(crate) fn post_pre_execute(&self, request: &Arc<dyn Dispatch>) {
        self.post_signal(request, Signal::PreExecute);
    }

    pub(crate) fn post_networking(&self, request: &Arc<dyn Dispatch>) {
        self.post_signal(request, Signal::Networking);
    }

    pub(crate) fn post_used_cache(&self, request: &Arc<dyn Dispatch>) {
        self.post_signal(request, Signal::UsedCache);
    }

    pub(crate) fn post_retry(&self, request: &Arc<dyn Dispatch>) {
        self.post_signal(request, Signal::Retry);
    }

    pub(crate) fn post_cancel(&self, request: &Arc<dyn Dispatch>) {
        self.post_signal(request, Signal::Cancel);
    }

    pub(crate) fn post_finish(&self, request: &Arc<dyn Dispatch>) {
        self.post_signal(request, Signal::Finish);
    }

    pub(crate) fn post_download_progress(
        &self,
        request: &Arc<dyn Dispatch>,
        total: u64,
        done: u64,
    ) {
        self.post_signal(request, Signal::Progress { total, done });
    }

    /// Delivers an error and finishes the request.
    ///
    /// A request cancelled before the error reaches the delivery context gets
    /// cancel and finish instead.
    pub(crate) fn post_error(&self, request: &Arc<dyn Dispatch>, error: RequestError) {
        let request = Arc::clone(request);
        self.post(Box::new(move || {
            if request.core().is_cancelled() {
                request.notify(Signal::Cancel);
            } else {
                request.notify_error(error);
            }
            request.notify(Signal::Finish);
        }));
    }

    /// Delivers a parsed response.
    ///
    /// A final response is followed by finish. `continuation` runs after the
    /// listener has seen the response; the cache worker uses it to queue the
    /// refresh of an intermediate response.
    pub(crate) fn post_response<T: Send + 'static>(
        &self,
        request: Arc<Request<T>>,
        response: Response<T>,
        continuation: Option<Task>,
    ) {
        self.post(Box::new(move || {
            if request.is_cancelled() {
                request.deliver_signal(Signal::Cancel);
                match continuation {
                    Some(continuation) => continuation(),
                    None => request.deliver_signal(Signal::Finish),
                }
                return;
            }

            let intermediate = response.is_intermediate();
            request.deliver_result(response.into_result());
            if !intermediate {
                request.deliver_signal(Signal::Finish);
            }
            if let Some(continuation) = continuation {
                continuation();
            }
        }));
    }
}
