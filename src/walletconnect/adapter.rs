//! Legacy wallet-connection bridge.
//!
//! Translates session negotiation, call requests, and chain switches into
//! approval-queue entries and device operations, and routes outcomes back
//! as protocol responses. Connection approval is automatic; every signing
//! call is individually gated.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::approval::{ApprovalQueue, RequestKind, RequestOrigin};
use crate::device::{DeviceOperation, DeviceState, DeviceStateController};
use crate::error::{ApprovalError, Error, ProtocolError};
use crate::pairing::{PairingStore, PairingType};
use crate::walletconnect::session::{Session, SessionState};
use crate::walletconnect::types::{
    CallMethod, CallOutcome, CallRequest, SessionApproval, SessionProposal, parse_switch_chain,
};

/// Chain assumed when a proposal does not name one.
const DEFAULT_CHAIN_ID: u64 = 1;

/// The wallet-connection protocol adapter. Cheap to clone; clones share
/// session state.
#[derive(Clone)]
pub struct ProtocolAdapter {
    controller: Arc<DeviceStateController>,
    queue: ApprovalQueue,
    store: Arc<PairingStore>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl ProtocolAdapter {
    pub fn new(
        controller: Arc<DeviceStateController>,
        queue: ApprovalQueue,
        store: Arc<PairingStore>,
    ) -> Self {
        Self {
            controller,
            queue,
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle an inbound session request.
    ///
    /// Resolves the device's exposed account for the proposed chain and
    /// accepts the connection. This approves a *connection*, nothing more:
    /// every later call still goes through the approval queue.
    pub async fn session_request(
        &self,
        proposal: SessionProposal,
    ) -> Result<SessionApproval, Error> {
        let chain_id = proposal.chain_id.unwrap_or(DEFAULT_CHAIN_ID);
        let account = self.controller.exposed_account(chain_id).await?;

        let mut session = Session::proposed(proposal.topic.clone(), chain_id, proposal.peer_meta);
        session.transition(SessionState::Approved)?;
        session.accounts = vec![account.clone()];

        tracing::info!(topic = %proposal.topic, chain_id, "session approved");
        self.sessions
            .write()
            .await
            .insert(proposal.topic, session);

        Ok(SessionApproval {
            chain_id,
            accounts: vec![account],
        })
    }

    /// The dApp confirmed the connection: activate the session and record
    /// the pairing so the service shows up alongside direct-API pairings.
    pub async fn connect(&self, topic: &str) -> Result<(), Error> {
        let peer_meta = {
            let mut sessions = self.sessions.write().await;
            let session =
                sessions
                    .get_mut(topic)
                    .ok_or_else(|| ProtocolError::SessionNotFound {
                        topic: topic.to_string(),
                    })?;
            session.transition(SessionState::Active)?;
            session.peer_meta.clone()
        };

        self.store
            .upsert(
                &peer_meta.name,
                &peer_meta.url,
                peer_meta.icons.first().map(String::as_str),
                PairingType::WalletConnect,
            )
            .await
            .map_err(Error::from)?;

        tracing::info!(topic, dapp = %peer_meta.name, "session active");
        Ok(())
    }

    /// Handle one inbound call request, suspending until it is decided.
    ///
    /// Unsupported methods are rejected here and never reach the queue.
    pub async fn call_request(&self, topic: &str, request: CallRequest) -> CallOutcome {
        let Some(method) = CallMethod::from_name(&request.method) else {
            tracing::warn!(method = %request.method, "unsupported call request method");
            return CallOutcome::rejected(request.id, "JSON RPC method not supported");
        };

        match self.session_state(topic).await {
            Some(SessionState::Active) => {}
            Some(state) => {
                return CallOutcome::rejected(request.id, format!("session is {state}"));
            }
            None => return CallOutcome::rejected(request.id, "unknown session"),
        }

        if method == CallMethod::SwitchChain {
            return self.switch_chain(topic, request).await;
        }

        let params = Value::Array(request.params);
        let operation = DeviceOperation::new(Some("Ethereum".to_string()), method.name(), params.clone());
        let submitted = match self
            .queue
            .enqueue(
                method.name(),
                params,
                RequestOrigin::Session {
                    topic: topic.to_string(),
                },
                RequestKind::Sign(operation),
            )
            .await
        {
            Ok(submitted) => submitted,
            Err(err) => return CallOutcome::rejected(request.id, err.to_string()),
        };

        match submitted.wait().await {
            Ok(result) => CallOutcome::approved(request.id, result),
            Err(ApprovalError::Rejected { .. }) => {
                CallOutcome::rejected(request.id, "User rejected request")
            }
            Err(err) => CallOutcome::rejected(request.id, err.to_string()),
        }
    }

    /// Chain switch: session bookkeeping updates synchronously; only the
    /// visible decision is queued.
    async fn switch_chain(&self, topic: &str, request: CallRequest) -> CallOutcome {
        let (chain_id, accounts) = match parse_switch_chain(&request.params) {
            Ok(parsed) => parsed,
            Err(err) => return CallOutcome::rejected(request.id, err.to_string()),
        };

        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(topic) {
                tracing::info!(topic, from = session.chain_id, to = chain_id, "chain switched");
                session.chain_id = chain_id;
                if let Some(accounts) = accounts {
                    session.accounts = accounts;
                }
            }
        }

        let submitted = match self
            .queue
            .enqueue(
                CallMethod::SwitchChain.name(),
                json!({ "chainId": chain_id }),
                RequestOrigin::Session {
                    topic: topic.to_string(),
                },
                RequestKind::Consent,
            )
            .await
        {
            Ok(submitted) => submitted,
            Err(err) => return CallOutcome::rejected(request.id, err.to_string()),
        };

        match submitted.wait().await {
            Ok(_) => CallOutcome::approved(request.id, json!("success")),
            Err(ApprovalError::Rejected { .. }) => {
                CallOutcome::rejected(request.id, "User rejected request")
            }
            Err(err) => CallOutcome::rejected(request.id, err.to_string()),
        }
    }

    /// Explicitly close a session, cancelling its undecided queue entries.
    /// Returns how many entries were cancelled.
    pub async fn disconnect(&self, topic: &str) -> Result<usize, Error> {
        {
            let mut sessions = self.sessions.write().await;
            let session =
                sessions
                    .get_mut(topic)
                    .ok_or_else(|| ProtocolError::SessionNotFound {
                        topic: topic.to_string(),
                    })?;
            if !session.state.is_terminal() {
                session.transition(SessionState::Disconnected)?;
            }
        }
        let cancelled = self.queue.cancel_session(topic).await;
        tracing::info!(topic, cancelled, "session disconnected");
        Ok(cancelled)
    }

    /// Watch the device: a disconnect tears down every live session.
    pub fn spawn_device_watcher(&self) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            let (_, mut events) = adapter.controller.subscribe().await;
            loop {
                match events.recv().await {
                    Ok(change) if change.current == DeviceState::Disconnected => {
                        adapter.disconnect_all().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "device event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn disconnect_all(&self) {
        let topics: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .values_mut()
                .filter(|session| !session.state.is_terminal())
                .map(|session| {
                    let _ = session.transition(SessionState::Disconnected);
                    session.topic.clone()
                })
                .collect()
        };
        for topic in topics {
            let cancelled = self.queue.cancel_session(&topic).await;
            tracing::info!(topic, cancelled, "session closed by device disconnect");
        }
    }

    pub async fn session(&self, topic: &str) -> Option<Session> {
        self.sessions.read().await.get(topic).cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn session_state(&self, topic: &str) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .get(topic)
            .map(|session| session.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{Decision, QueueConfig};
    use crate::device::{Detection, DeviceTransport, SimulatedDevice};
    use crate::walletconnect::types::PeerMetadata;
    use std::time::Duration;

    struct Harness {
        adapter: ProtocolAdapter,
        queue: ApprovalQueue,
        controller: Arc<DeviceStateController>,
        device: Arc<SimulatedDevice>,
        store: Arc<PairingStore>,
    }

    async fn harness() -> Harness {
        let device = Arc::new(SimulatedDevice::new());
        let transport: Arc<dyn DeviceTransport> = device.clone();
        let controller = Arc::new(DeviceStateController::new(transport));
        controller.probe().await;
        let queue = ApprovalQueue::new(Arc::clone(&controller), QueueConfig::default());
        let store = Arc::new(PairingStore::in_memory());
        let adapter = ProtocolAdapter::new(
            Arc::clone(&controller),
            queue.clone(),
            Arc::clone(&store),
        );
        Harness {
            adapter,
            queue,
            controller,
            device,
            store,
        }
    }

    fn proposal(topic: &str) -> SessionProposal {
        SessionProposal {
            topic: topic.to_string(),
            chain_id: None,
            peer_meta: PeerMetadata {
                name: "Example dApp".to_string(),
                url: "https://example.org".to_string(),
                description: None,
                icons: vec!["https://example.org/icon.png".to_string()],
            },
        }
    }

    async fn active_session(h: &Harness, topic: &str) {
        h.adapter.session_request(proposal(topic)).await.unwrap();
        h.adapter.connect(topic).await.unwrap();
    }

    /// Run a call request concurrently and decide it once it shows up in
    /// the queue.
    async fn call_and_decide(
        h: &Harness,
        topic: &str,
        request: CallRequest,
        decision: Decision,
    ) -> CallOutcome {
        let adapter = h.adapter.clone();
        let topic = topic.to_string();
        let handle = tokio::spawn(async move { adapter.call_request(&topic, request).await });

        let pending = wait_for_pending(&h.queue).await;
        h.queue.decide(pending, decision).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("call request should resolve")
            .unwrap()
    }

    async fn wait_for_pending(queue: &ApprovalQueue) -> uuid::Uuid {
        for _ in 0..100 {
            if let Some(request) = queue.list().await.first() {
                return request.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no pending request appeared");
    }

    // --- Session lifecycle ---

    #[tokio::test]
    async fn test_session_request_exposes_device_account() {
        let h = harness().await;
        let approval = h.adapter.session_request(proposal("topic-1")).await.unwrap();

        assert_eq!(approval.chain_id, 1);
        assert_eq!(approval.accounts.len(), 1);
        assert!(approval.accounts[0].starts_with("0x"));

        let session = h.adapter.session("topic-1").await.unwrap();
        assert_eq!(session.state, SessionState::Approved);
    }

    #[tokio::test]
    async fn test_session_request_fails_without_device() {
        let h = harness().await;
        h.device.set_detection(Detection::Absent);
        h.controller.probe().await;

        let err = h.adapter.session_request(proposal("topic-1")).await.unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert!(h.adapter.session("topic-1").await.is_none());
    }

    #[tokio::test]
    async fn test_connect_activates_and_records_pairing() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let session = h.adapter.session("topic-1").await.unwrap();
        assert_eq!(session.state, SessionState::Active);

        let pairings = h.store.list().await;
        assert_eq!(pairings.len(), 1);
        assert_eq!(pairings[0].service_name, "Example dApp");
        assert_eq!(pairings[0].pairing_type, PairingType::WalletConnect);
    }

    #[tokio::test]
    async fn test_reconnect_same_dapp_does_not_duplicate_pairing() {
        let h = harness().await;
        active_session(&h, "topic-1").await;
        h.adapter.disconnect("topic-1").await.unwrap();
        active_session(&h, "topic-2").await;

        assert_eq!(h.store.list().await.len(), 1);
    }

    // --- Call requests ---

    #[tokio::test]
    async fn test_unsupported_method_rejected_without_queueing() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let outcome = h
            .adapter
            .call_request(
                "topic-1",
                CallRequest {
                    id: 42,
                    method: "foo_unsupported".to_string(),
                    params: vec![],
                },
            )
            .await;

        match outcome {
            CallOutcome::Rejection { id, error } => {
                assert_eq!(id, 42);
                assert!(error.message.contains("not supported"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(h.queue.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_call_request_on_unknown_session_rejected() {
        let h = harness().await;
        let outcome = h
            .adapter
            .call_request(
                "nope",
                CallRequest {
                    id: 1,
                    method: "personal_sign".to_string(),
                    params: vec![],
                },
            )
            .await;
        assert!(!outcome.is_approved());
        assert!(h.queue.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_approved_sign_call_returns_artifact() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let outcome = call_and_decide(
            &h,
            "topic-1",
            CallRequest {
                id: 7,
                method: "personal_sign".to_string(),
                params: vec![json!("0xdeadbeef")],
            },
            Decision::Approve,
        )
        .await;

        match outcome {
            CallOutcome::Approval { id, result } => {
                assert_eq!(id, 7);
                assert!(result.as_str().unwrap().starts_with("0x"));
            }
            other => panic!("expected approval, got {:?}", other),
        }
        assert_eq!(h.device.executed_count(), 1);
    }

    #[tokio::test]
    async fn test_each_supported_method_is_queued_under_its_name() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        for method in [
            "personal_sign",
            "eth_sendTransaction",
            "eth_signTransaction",
            "eth_signTypedData",
        ] {
            let adapter = h.adapter.clone();
            let request = CallRequest {
                id: 1,
                method: method.to_string(),
                params: vec![json!({})],
            };
            let handle =
                tokio::spawn(async move { adapter.call_request("topic-1", request).await });

            let pending_id = wait_for_pending(&h.queue).await;
            let listed = h.queue.list().await;
            assert_eq!(listed.len(), 1, "exactly one pending request for {method}");
            assert_eq!(listed[0].method, method);

            h.queue.decide(pending_id, Decision::Approve).await.unwrap();
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejected_typed_data_call_leaves_session_active() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let outcome = call_and_decide(
            &h,
            "topic-1",
            CallRequest {
                id: 9,
                method: "eth_signTypedData".to_string(),
                params: vec![json!("0x33b35c"), json!("{}")],
            },
            Decision::Reject { reason: None },
        )
        .await;

        match outcome {
            CallOutcome::Rejection { id, error } => {
                assert_eq!(id, 9);
                assert_eq!(error.message, "User rejected request");
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let session = h.adapter.session("topic-1").await.unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(h.device.executed_count(), 0);
    }

    // --- Chain switch ---

    #[tokio::test]
    async fn test_switch_chain_updates_bookkeeping_before_decision() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let adapter = h.adapter.clone();
        let handle = tokio::spawn(async move {
            adapter
                .call_request(
                    "topic-1",
                    CallRequest {
                        id: 3,
                        method: "wallet_switchEthereumChain".to_string(),
                        params: vec![json!({"chainId": "0x89"})],
                    },
                )
                .await
        });

        let pending_id = wait_for_pending(&h.queue).await;

        // Bookkeeping already applied while the decision is still pending.
        let session = h.adapter.session("topic-1").await.unwrap();
        assert_eq!(session.chain_id, 137);

        h.queue.decide(pending_id, Decision::Approve).await.unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, json_outcome(3, json!("success")));
        assert_eq!(h.device.executed_count(), 0);
    }

    fn json_outcome(id: u64, result: Value) -> CallOutcome {
        CallOutcome::approved(id, result)
    }

    #[tokio::test]
    async fn test_switch_chain_malformed_params_rejected_without_queueing() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let outcome = h
            .adapter
            .call_request(
                "topic-1",
                CallRequest {
                    id: 4,
                    method: "wallet_switchEthereumChain".to_string(),
                    params: vec![json!({"chainId": "zzz"})],
                },
            )
            .await;
        assert!(!outcome.is_approved());
        assert!(h.queue.list().await.is_empty());
    }

    // --- Disconnect ---

    #[tokio::test]
    async fn test_disconnect_cancels_pending_entries() {
        let h = harness().await;
        active_session(&h, "topic-1").await;

        let adapter = h.adapter.clone();
        let handle = tokio::spawn(async move {
            adapter
                .call_request(
                    "topic-1",
                    CallRequest {
                        id: 5,
                        method: "personal_sign".to_string(),
                        params: vec![json!("0xdead")],
                    },
                )
                .await
        });
        wait_for_pending(&h.queue).await;

        let cancelled = h.adapter.disconnect("topic-1").await.unwrap();
        assert_eq!(cancelled, 1);

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled call should resolve")
            .unwrap();
        match outcome {
            CallOutcome::Rejection { error, .. } => {
                assert!(error.message.contains("session disconnected"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let session = h.adapter.session("topic-1").await.unwrap();
        assert!(session.state.is_terminal());
    }

    #[tokio::test]
    async fn test_device_disconnect_tears_down_sessions() {
        let h = harness().await;
        active_session(&h, "topic-1").await;
        let watcher = h.adapter.spawn_device_watcher();

        let adapter = h.adapter.clone();
        let handle = tokio::spawn(async move {
            adapter
                .call_request(
                    "topic-1",
                    CallRequest {
                        id: 6,
                        method: "personal_sign".to_string(),
                        params: vec![],
                    },
                )
                .await
        });
        wait_for_pending(&h.queue).await;

        h.device.set_detection(Detection::Absent);
        h.controller.probe().await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("call should be cancelled by device disconnect")
            .unwrap();
        assert!(!outcome.is_approved());

        // Session reached its terminal state.
        for _ in 0..100 {
            if h.adapter.session("topic-1").await.unwrap().state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.adapter.session("topic-1").await.unwrap().state.is_terminal());

        watcher.abort();
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session_errors() {
        let h = harness().await;
        let err = h.adapter.disconnect("nope").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_on_disconnected_session_rejected() {
        let h = harness().await;
        active_session(&h, "topic-1").await;
        h.adapter.disconnect("topic-1").await.unwrap();

        let outcome = h
            .adapter
            .call_request(
                "topic-1",
                CallRequest {
                    id: 8,
                    method: "personal_sign".to_string(),
                    params: vec![],
                },
            )
            .await;
        assert!(!outcome.is_approved());
        assert!(h.queue.list().await.is_empty());
    }
}
