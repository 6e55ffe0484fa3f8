//! Manual-approval queue for device operations.
//!
//! Every signing-style request lands here and suspends until the device
//! owner decides it. Presentation order is FIFO by enqueue time; decisions
//! may arrive in any order. Approved device work is handed to a single
//! executor task, which is what guarantees at-most-one concurrent device
//! operation and FIFO execution by approval time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::device::{DeviceOperation, DeviceStateController};
use crate::error::{ApprovalError, DeviceError};

/// Where a pending request came from. A back-reference for routing and
/// cancellation, not ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RequestOrigin {
    /// Submitted over the bridge server by a paired application.
    ApiKey { api_key: String },
    /// Submitted through a wallet-connection session.
    Session { topic: String },
    /// A pairing negotiation that has no credential yet.
    Pairing { service_name: String },
}

/// What approving a request means.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Requires one device round trip once approved.
    Sign(DeviceOperation),
    /// The decision is the outcome itself (pairing negotiation,
    /// chain-switch acknowledgement); the device is never touched.
    Consent,
}

/// A queued request awaiting a human decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub id: Uuid,
    /// Signing operation kind, e.g. `personal_sign`.
    pub method: String,
    /// Opaque to the queue; rendered for the human as-is.
    pub params: Value,
    pub origin: RequestOrigin,
    pub submitted_at: DateTime<Utc>,
}

/// The decision surface exposed to the presentation layer.
#[derive(Debug, Clone)]
pub enum Decision {
    Approve,
    Reject { reason: Option<String> },
}

/// Events for the presentation layer's pending-request feed.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued(PendingRequest),
    Decided { id: Uuid, approved: bool },
    Cancelled { id: Uuid },
}

/// Queue behavior knobs.
///
/// Both timeouts default to `None`: a request stuck while the device is
/// away stays queued until someone decides it. Expiry is the embedder's
/// policy, not the queue's.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum undecided requests held at once.
    pub max_pending: usize,
    /// Expire requests that receive no decision within this window.
    pub decision_timeout: Option<Duration>,
    /// Bound how long an approved request waits for the device to return.
    pub connect_wait_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 64,
            decision_timeout: None,
            connect_wait_timeout: None,
        }
    }
}

/// Handle returned to the submitting caller.
#[derive(Debug)]
pub struct SubmittedRequest {
    pub id: Uuid,
    outcome: oneshot::Receiver<Result<Value, ApprovalError>>,
}

impl SubmittedRequest {
    /// Suspend until the request is decided (and, if approved, executed).
    pub async fn wait(self) -> Result<Value, ApprovalError> {
        self.outcome.await.unwrap_or(Err(ApprovalError::Closed))
    }
}

struct PendingEntry {
    request: PendingRequest,
    kind: RequestKind,
    outcome_tx: oneshot::Sender<Result<Value, ApprovalError>>,
}

struct ExecutionJob {
    request_id: Uuid,
    op: DeviceOperation,
    outcome_tx: oneshot::Sender<Result<Value, ApprovalError>>,
}

/// The approval queue. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ApprovalQueue {
    pending: Arc<RwLock<Vec<PendingEntry>>>,
    events: broadcast::Sender<QueueEvent>,
    exec_tx: mpsc::UnboundedSender<ExecutionJob>,
    config: QueueConfig,
}

impl ApprovalQueue {
    /// Create the queue and spawn its executor task.
    pub fn new(controller: Arc<DeviceStateController>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        tokio::spawn(execution_worker(
            exec_rx,
            controller,
            config.connect_wait_timeout,
        ));
        Self {
            pending: Arc::new(RwLock::new(Vec::new())),
            events,
            exec_tx,
            config,
        }
    }

    /// Subscribe to the pending-request feed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// The event feed as a `Stream`, for presentation layers that consume
    /// streams rather than raw broadcast receivers. Lagged events are
    /// dropped, not surfaced.
    pub fn event_stream(&self) -> impl futures::Stream<Item = QueueEvent> + use<> {
        use tokio_stream::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| event.ok())
    }

    /// Enqueue a request for manual approval.
    ///
    /// The caller suspends on the returned handle; the request stays
    /// listed until decided, expired, or cancelled — device absence never
    /// auto-rejects it.
    pub async fn enqueue(
        &self,
        method: impl Into<String>,
        params: Value,
        origin: RequestOrigin,
        kind: RequestKind,
    ) -> Result<SubmittedRequest, ApprovalError> {
        let request = PendingRequest {
            id: Uuid::new_v4(),
            method: method.into(),
            params,
            origin,
            submitted_at: Utc::now(),
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            if pending.len() >= self.config.max_pending {
                return Err(ApprovalError::QueueFull {
                    size: pending.len(),
                    max: self.config.max_pending,
                });
            }
            pending.push(PendingEntry {
                request: request.clone(),
                kind,
                outcome_tx,
            });
        }

        tracing::info!(id = %request.id, method = %request.method, "request awaiting approval");
        let _ = self.events.send(QueueEvent::Enqueued(request.clone()));

        if let Some(timeout) = self.config.decision_timeout {
            let queue = self.clone();
            let id = request.id;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                queue.expire(id, timeout).await;
            });
        }

        Ok(SubmittedRequest {
            id: request.id,
            outcome: outcome_rx,
        })
    }

    /// Decide a pending request.
    ///
    /// Rejection resolves the caller immediately and never touches the
    /// device. Approval of a `Sign` request is forwarded to the executor;
    /// approvals run in the order they were made, one at a time.
    pub async fn decide(&self, id: Uuid, decision: Decision) -> Result<(), ApprovalError> {
        let entry = self
            .remove_entry(id)
            .await
            .ok_or(ApprovalError::NotFound { id })?;

        match decision {
            Decision::Reject { reason } => {
                tracing::info!(%id, "request rejected by user");
                let _ = self.events.send(QueueEvent::Decided {
                    id,
                    approved: false,
                });
                let _ = entry.outcome_tx.send(Err(ApprovalError::Rejected { reason }));
            }
            Decision::Approve => {
                tracing::info!(%id, method = %entry.request.method, "request approved");
                let _ = self.events.send(QueueEvent::Decided { id, approved: true });
                match entry.kind {
                    RequestKind::Consent => {
                        let _ = entry.outcome_tx.send(Ok(Value::Null));
                    }
                    RequestKind::Sign(op) => {
                        self.exec_tx
                            .send(ExecutionJob {
                                request_id: id,
                                op,
                                outcome_tx: entry.outcome_tx,
                            })
                            .map_err(|_| ApprovalError::Closed)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Snapshot of undecided requests, FIFO by enqueue time.
    pub async fn list(&self) -> Vec<PendingRequest> {
        self.pending
            .read()
            .await
            .iter()
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Cancel every undecided request belonging to a session.
    ///
    /// Already-approved work is not recalled; only entries still waiting
    /// for a decision resolve with a cancellation error.
    pub async fn cancel_session(&self, topic: &str) -> usize {
        let cancelled = {
            let mut pending = self.pending.write().await;
            let drained: Vec<PendingEntry> = pending.drain(..).collect();
            let (cancelled, kept): (Vec<_>, Vec<_>) = drained.into_iter().partition(|entry| {
                matches!(&entry.request.origin, RequestOrigin::Session { topic: t } if t == topic)
            });
            *pending = kept;
            cancelled
        };

        let count = cancelled.len();
        for entry in cancelled {
            let id = entry.request.id;
            tracing::info!(%id, topic, "pending request cancelled with its session");
            let _ = self.events.send(QueueEvent::Cancelled { id });
            let _ = entry.outcome_tx.send(Err(ApprovalError::Cancelled {
                reason: "session disconnected".to_string(),
            }));
        }
        count
    }

    async fn expire(&self, id: Uuid, timeout: Duration) {
        if let Some(entry) = self.remove_entry(id).await {
            tracing::info!(%id, ?timeout, "pending request expired without a decision");
            let _ = self.events.send(QueueEvent::Cancelled { id });
            let _ = entry
                .outcome_tx
                .send(Err(ApprovalError::DecisionTimeout { timeout }));
        }
    }

    async fn remove_entry(&self, id: Uuid) -> Option<PendingEntry> {
        let mut pending = self.pending.write().await;
        let index = pending.iter().position(|entry| entry.request.id == id)?;
        Some(pending.remove(index))
    }
}

/// The single device executor: jobs arrive in approval order and run one
/// at a time. Waits out device absence (optionally bounded) before each
/// job; a device-reported failure completes the job, never retried.
async fn execution_worker(
    mut jobs: mpsc::UnboundedReceiver<ExecutionJob>,
    controller: Arc<DeviceStateController>,
    connect_wait: Option<Duration>,
) {
    while let Some(job) = jobs.recv().await {
        let outcome = run_job(&controller, connect_wait, &job.op).await;
        if let Err(err) = &outcome {
            tracing::warn!(id = %job.request_id, error = %err, "approved request failed");
        } else {
            tracing::info!(id = %job.request_id, "approved request executed");
        }
        let _ = job.outcome_tx.send(outcome);
    }
}

async fn run_job(
    controller: &DeviceStateController,
    connect_wait: Option<Duration>,
    op: &DeviceOperation,
) -> Result<Value, ApprovalError> {
    loop {
        match connect_wait {
            Some(timeout) => {
                if tokio::time::timeout(timeout, controller.wait_until_connected())
                    .await
                    .is_err()
                {
                    return Err(ApprovalError::ConnectTimeout { timeout });
                }
            }
            None => controller.wait_until_connected().await,
        }
        match controller.execute(op).await {
            // Lost the device between the wait and the operation start; the
            // device was never touched, so keep waiting for it.
            Err(DeviceError::Unavailable { .. }) => continue,
            other => return other.map_err(ApprovalError::from),
        }
    }
}
