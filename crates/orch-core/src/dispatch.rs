//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Detached background execution with guaranteed terminal writes."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orch_metrics::EngineMetrics;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::error::Result;
use crate::tracker::TerminalSink;

const INTERRUPTED: &str = "execution was interrupted before completion";
const UNFINISHED: &str = "execution ended without a terminal status";

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Runs units of work on the tokio runtime and guarantees each unit's
/// tracking record reaches a terminal state.
///
/// Every unit is wrapped in a supervisor task. Whatever ends the unit (an
/// `Err`, a panic, the optional timeout, or the supervisor being dropped at
/// runtime shutdown), the supervisor's guard writes `Failed` through the
/// unit's [`TerminalSink`]. That write is a no-op when the unit already
/// recorded its own terminal state.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    timeout: Option<Duration>,
    in_flight: Arc<InFlight>,
    metrics: Option<EngineMetrics>,
}

impl TaskDispatcher {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            in_flight: Arc::new(InFlight::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of units dispatched but not yet finalised.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Detach `work` for the record `record_id`. Must be called within a tokio runtime.
    ///
    /// The in-flight count is raised before this returns, so a subsequent
    /// [`wait_idle`](Self::wait_idle) always covers the unit.
    pub fn dispatch<F>(
        &self,
        record_id: String,
        sink: Arc<dyn TerminalSink>,
        work: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.unit_started();
        }

        let mut guard = FinalizeGuard {
            record_id,
            sink,
            reason: INTERRUPTED.to_owned(),
            inner: None,
            in_flight: self.in_flight.clone(),
            metrics: self.metrics.clone(),
        };
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut inner = tokio::spawn(work);
            guard.inner = Some(inner.abort_handle());

            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut inner).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        inner.abort();
                        warn!(record_id = %guard.record_id, timeout_ms = limit.as_millis() as u64, "background unit timed out");
                        guard.record_reason(format!("timed out after {}ms", limit.as_millis()));
                        return;
                    }
                },
                None => (&mut inner).await,
            };

            guard.record_reason(match joined {
                Ok(Ok(())) => UNFINISHED.to_owned(),
                Ok(Err(err)) => err.to_string(),
                Err(join_err) => describe_join_error(join_err),
            });
        })
    }

    /// Resolve once no dispatched unit remains in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct FinalizeGuard {
    record_id: String,
    sink: Arc<dyn TerminalSink>,
    reason: String,
    inner: Option<AbortHandle>,
    in_flight: Arc<InFlight>,
    metrics: Option<EngineMetrics>,
}

impl FinalizeGuard {
    /// Reason written by `drop` if the unit left its record non-terminal.
    fn record_reason(&mut self, reason: String) {
        self.reason = reason;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.abort();
        }
        if self.sink.fail(&self.record_id, &self.reason) {
            debug!(record_id = %self.record_id, reason = %self.reason, "supervisor wrote terminal failure");
        }
        if let Some(metrics) = &self.metrics {
            metrics.unit_finished();
        }
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_cancelled() {
        return INTERRUPTED.to_owned();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("unit panicked: {}", panic_message(payload.as_ref())),
        Err(_) => INTERRUPTED.to_owned(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
