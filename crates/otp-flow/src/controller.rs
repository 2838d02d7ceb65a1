//! Drives one OTP flow at a time against the capability table.
//!
//! The controller owns a single flow slot. Every opened flow gets a
//! fresh generation number, and every network outcome is applied only
//! if the slot still holds the generation that started the call. A
//! response that arrives after its flow was cancelled or replaced is
//! discarded instead of corrupting the current flow.

use crate::context::{OtpContext, OtpContextSpec};
use crate::machine::{OtpMachine, OtpMachineInput, OtpState};
use crate::ops::{FlowError, OtpOperations};
use serde_json::{json, Value};
use session_engine::{SessionController, SessionError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("a verification flow is already in progress")]
    ConcurrentFlow,

    #[error("no verification flow is active")]
    FlowClosed,

    #[error("operation not permitted while the flow is {0:?}")]
    InvalidState(OtpState),

    #[error("unknown verification context")]
    UnknownContext,

    #[error("could not send the code: {0}")]
    Send(FlowError),

    #[error("verification failed: {0}")]
    Verification(FlowError),

    #[error("could not resend the code: {0}")]
    Resend(FlowError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

pub type OtpResult<T> = Result<T, OtpError>;

struct ActiveFlow {
    generation: u64,
    spec: OtpContextSpec,
    /// Arguments that identify the target (email, complaint draft id),
    /// re-sent verbatim on resend and merged into verify requests.
    target: Value,
    machine: OtpMachine,
    last_error: Option<FlowError>,
}

#[derive(Default)]
struct FlowSlot {
    next_generation: u64,
    active: Option<ActiveFlow>,
}

/// One OTP flow at a time, across all contexts.
pub struct OtpFlowController {
    operations: Arc<dyn OtpOperations>,
    session: Arc<SessionController>,
    contexts: HashMap<OtpContext, OtpContextSpec>,
    slot: Mutex<FlowSlot>,
}

impl OtpFlowController {
    pub fn new(
        operations: Arc<dyn OtpOperations>,
        session: Arc<SessionController>,
        contexts: HashMap<OtpContext, OtpContextSpec>,
    ) -> Self {
        Self {
            operations,
            session,
            contexts,
            slot: Mutex::new(FlowSlot::default()),
        }
    }

    /// Open a flow: claim the slot, then ask the server to deliver a
    /// code. A failed delivery releases the slot again.
    pub async fn open(&self, context: OtpContext, target: Value) -> OtpResult<()> {
        let spec = self
            .contexts
            .get(&context)
            .cloned()
            .ok_or(OtpError::UnknownContext)?;

        let generation = {
            let mut slot = self.slot.lock().unwrap();
            if slot.active.is_some() {
                return Err(OtpError::ConcurrentFlow);
            }
            slot.next_generation += 1;
            let generation = slot.next_generation;
            slot.active = Some(ActiveFlow {
                generation,
                spec: spec.clone(),
                target: target.clone(),
                machine: OtpMachine::new(),
                last_error: None,
            });
            generation
        };

        match self.operations.send_code(&spec, &target).await {
            Ok(_) => {
                let mut slot = self.slot.lock().unwrap();
                match current_flow(&mut slot, generation) {
                    Some(flow) => {
                        let _ = flow.machine.consume(&OtpMachineInput::Opened);
                        info!(context = ?context, "Verification code sent");
                        Ok(())
                    }
                    None => Err(OtpError::FlowClosed),
                }
            }
            Err(error) => {
                let mut slot = self.slot.lock().unwrap();
                if current_flow(&mut slot, generation).is_some() {
                    slot.active = None;
                }
                warn!(context = ?context, error = %error, "Code delivery failed");
                Err(OtpError::Send(error))
            }
        }
    }

    /// Present a code. On acceptance, contexts that issue credentials
    /// sign the user in before the flow reaches `Verified`.
    ///
    /// A rejected code moves the flow to `Failed`, where both another
    /// attempt and a resend remain possible. An outcome arriving after
    /// the flow was cancelled or replaced is discarded.
    pub async fn verify(&self, code: &str) -> OtpResult<Value> {
        let (generation, spec, args) = {
            let mut slot = self.slot.lock().unwrap();
            let flow = slot.active.as_mut().ok_or(OtpError::FlowClosed)?;
            let state = OtpState::from(flow.machine.state());
            flow.machine
                .consume(&OtpMachineInput::VerifyAttempt)
                .map_err(|_| OtpError::InvalidState(state))?;

            let mut args = flow.target.clone();
            if let Value::Object(map) = &mut args {
                map.insert("code".to_string(), json!(code));
            } else {
                args = json!({ "code": code });
            }
            (flow.generation, flow.spec.clone(), args)
        };

        let outcome = self.operations.verify_code(&spec, &args).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                let mut slot = self.slot.lock().unwrap();
                let flow = match current_flow(&mut slot, generation) {
                    Some(flow) => flow,
                    None => {
                        debug!("Discarding verification outcome for a closed flow");
                        return Err(OtpError::FlowClosed);
                    }
                };
                let _ = flow.machine.consume(&OtpMachineInput::VerifyFailed);
                flow.last_error = Some(error.clone());
                warn!(context = ?spec.context, error = %error, "Code rejected");
                return Err(OtpError::Verification(error));
            }
        };

        // Credentials are installed without holding the slot lock: the
        // session change callback may re-enter the controller to read
        // flow state. The generation is re-checked on every acquisition,
        // so an outcome for a replaced flow still never lands.
        if let Some((token, user)) = outcome.credentials {
            {
                let mut slot = self.slot.lock().unwrap();
                if current_flow(&mut slot, generation).is_none() {
                    debug!("Discarding verification outcome for a closed flow");
                    return Err(OtpError::FlowClosed);
                }
            }
            if let Err(e) = self.session.set_credentials(&token, Some(user)) {
                let mut slot = self.slot.lock().unwrap();
                if let Some(flow) = current_flow(&mut slot, generation) {
                    let _ = flow.machine.consume(&OtpMachineInput::VerifyFailed);
                    flow.last_error = Some(FlowError {
                        message: e.to_string(),
                        status_code: None,
                    });
                }
                return Err(OtpError::Session(e));
            }
        }

        let mut slot = self.slot.lock().unwrap();
        let flow = match current_flow(&mut slot, generation) {
            Some(flow) => flow,
            None => {
                debug!("Discarding verification outcome for a closed flow");
                return Err(OtpError::FlowClosed);
            }
        };
        let _ = flow.machine.consume(&OtpMachineInput::VerifySucceeded);
        flow.last_error = None;
        info!(context = ?spec.context, "Code verified");
        Ok(outcome.payload)
    }

    /// Ask for a fresh code. The flow state only advances when the
    /// server confirms delivery; a failed resend leaves the flow exactly
    /// where it was so the user can retry either way.
    pub async fn resend(&self) -> OtpResult<()> {
        let (generation, spec, target) = {
            let slot = self.slot.lock().unwrap();
            let flow = slot.active.as_ref().ok_or(OtpError::FlowClosed)?;
            let state = OtpState::from(flow.machine.state());
            if !state.can_resend() {
                return Err(OtpError::InvalidState(state));
            }
            (flow.generation, flow.spec.clone(), flow.target.clone())
        };

        match self.operations.resend_code(&spec, &target).await {
            Ok(_) => {
                let mut slot = self.slot.lock().unwrap();
                let flow = current_flow(&mut slot, generation).ok_or(OtpError::FlowClosed)?;
                let _ = flow.machine.consume(&OtpMachineInput::ResendRequested);
                info!(context = ?spec.context, "Verification code resent");
                Ok(())
            }
            Err(error) => {
                let mut slot = self.slot.lock().unwrap();
                if let Some(flow) = current_flow(&mut slot, generation) {
                    flow.last_error = Some(error.clone());
                }
                warn!(context = ?spec.context, error = %error, "Resend failed");
                Err(OtpError::Resend(error))
            }
        }
    }

    /// Abandon the flow. Idempotent; in-flight outcomes for the
    /// abandoned flow are discarded when they arrive.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock().unwrap();
        if slot.active.take().is_some() {
            info!("Verification flow cancelled");
        }
    }

    /// Close a verified flow after its payload has been consumed.
    pub fn complete(&self) -> OtpResult<()> {
        let mut slot = self.slot.lock().unwrap();
        let flow = slot.active.as_mut().ok_or(OtpError::FlowClosed)?;
        let state = OtpState::from(flow.machine.state());
        flow.machine
            .consume(&OtpMachineInput::Completed)
            .map_err(|_| OtpError::InvalidState(state))?;
        slot.active = None;
        Ok(())
    }

    /// Current flow state; `Idle` when no flow is open.
    pub fn state(&self) -> OtpState {
        let slot = self.slot.lock().unwrap();
        slot.active
            .as_ref()
            .map(|flow| OtpState::from(flow.machine.state()))
            .unwrap_or(OtpState::Idle)
    }

    pub fn context(&self) -> Option<OtpContext> {
        let slot = self.slot.lock().unwrap();
        slot.active.as_ref().map(|flow| flow.spec.context)
    }

    pub fn last_error(&self) -> Option<FlowError> {
        let slot = self.slot.lock().unwrap();
        slot.active.as_ref().and_then(|flow| flow.last_error.clone())
    }
}

fn current_flow(slot: &mut FlowSlot, generation: u64) -> Option<&mut ActiveFlow> {
    slot.active
        .as_mut()
        .filter(|flow| flow.generation == generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::default_context_table;
    use crate::ops::VerifyOutcome;
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::Utc;
    use credential_store::MemoryStorage;
    use portal_transport::TokenCell;
    use session_engine::UserRecord;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    struct MockOps {
        send: Mutex<VecDeque<Result<Value, FlowError>>>,
        verify: Mutex<VecDeque<Result<VerifyOutcome, FlowError>>>,
        resend: Mutex<VecDeque<Result<Value, FlowError>>>,
        /// When present, verify_code parks here until notified.
        verify_gate: Option<Arc<Notify>>,
    }

    impl MockOps {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                send: Mutex::new(VecDeque::new()),
                verify: Mutex::new(VecDeque::new()),
                resend: Mutex::new(VecDeque::new()),
                verify_gate: None,
            })
        }

        fn gated() -> (Arc<Self>, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let ops = Arc::new(Self {
                send: Mutex::new(VecDeque::new()),
                verify: Mutex::new(VecDeque::new()),
                resend: Mutex::new(VecDeque::new()),
                verify_gate: Some(gate.clone()),
            });
            (ops, gate)
        }

        fn script_send(&self, result: Result<Value, FlowError>) {
            self.send.lock().unwrap().push_back(result);
        }

        fn script_verify(&self, result: Result<VerifyOutcome, FlowError>) {
            self.verify.lock().unwrap().push_back(result);
        }

        fn script_resend(&self, result: Result<Value, FlowError>) {
            self.resend.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl OtpOperations for MockOps {
        async fn send_code(
            &self,
            _spec: &OtpContextSpec,
            _target: &Value,
        ) -> Result<Value, FlowError> {
            self.send
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({})))
        }

        async fn verify_code(
            &self,
            _spec: &OtpContextSpec,
            _args: &Value,
        ) -> Result<VerifyOutcome, FlowError> {
            if let Some(gate) = &self.verify_gate {
                gate.notified().await;
            }
            self.verify
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(VerifyOutcome {
                        credentials: None,
                        payload: json!({}),
                    })
                })
        }

        async fn resend_code(
            &self,
            _spec: &OtpContextSpec,
            _target: &Value,
        ) -> Result<Value, FlowError> {
            self.resend
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({})))
        }
    }

    fn make_token(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
        let payload = URL_SAFE_NO_PAD
            .encode(json!({"sub": "u-1", "role": "citizen", "exp": exp}).to_string());
        format!("{header}.{payload}.sig")
    }

    fn citizen() -> UserRecord {
        UserRecord {
            id: "u-1".to_string(),
            email: Some("resident@example.org".to_string()),
            name: None,
            role: Some("citizen".to_string()),
            ward_id: None,
            has_password: false,
        }
    }

    fn login_outcome() -> VerifyOutcome {
        VerifyOutcome {
            credentials: Some((make_token(Utc::now().timestamp() + 3600), citizen())),
            payload: json!({"ok": true}),
        }
    }

    fn rejected_code() -> FlowError {
        FlowError {
            message: "invalid code".to_string(),
            status_code: Some(400),
        }
    }

    fn controller_with(ops: Arc<MockOps>) -> (Arc<OtpFlowController>, Arc<SessionController>) {
        let session = Arc::new(SessionController::new(
            Arc::new(MemoryStorage::new()),
            TokenCell::new(),
        ));
        let controller = Arc::new(OtpFlowController::new(
            ops,
            session.clone(),
            default_context_table(),
        ));
        (controller, session)
    }

    fn email_target() -> Value {
        json!({"email": "resident@example.org"})
    }

    // ===== open tests =====

    #[tokio::test]
    async fn open_sends_code_and_enters_sent() {
        let ops = MockOps::new();
        let (controller, _) = controller_with(ops);

        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();

        assert_eq!(controller.state(), OtpState::Sent);
        assert_eq!(controller.context(), Some(OtpContext::Login));
    }

    #[tokio::test]
    async fn open_while_active_is_rejected() {
        let ops = MockOps::new();
        let (controller, _) = controller_with(ops);
        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();

        let err = controller
            .open(OtpContext::Registration, email_target())
            .await
            .unwrap_err();

        assert!(matches!(err, OtpError::ConcurrentFlow));
        assert_eq!(controller.context(), Some(OtpContext::Login));
    }

    #[tokio::test]
    async fn failed_delivery_releases_the_slot() {
        let ops = MockOps::new();
        ops.script_send(Err(FlowError {
            message: "mail service down".to_string(),
            status_code: Some(502),
        }));
        let (controller, _) = controller_with(ops);

        let err = controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap_err();

        assert!(matches!(err, OtpError::Send(_)));
        assert_eq!(controller.state(), OtpState::Idle);

        // The slot is free again.
        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();
        assert_eq!(controller.state(), OtpState::Sent);
    }

    // ===== verify tests =====

    #[tokio::test]
    async fn accepted_login_code_signs_the_user_in() {
        let ops = MockOps::new();
        ops.script_verify(Ok(login_outcome()));
        let (controller, session) = controller_with(ops);

        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();
        let payload = controller.verify("123456").await.unwrap();

        assert_eq!(payload, json!({"ok": true}));
        assert_eq!(controller.state(), OtpState::Verified);
        assert!(session.is_authenticated());
        assert_eq!(session.user_role(), Some("citizen".to_string()));

        controller.complete().unwrap();
        assert_eq!(controller.state(), OtpState::Idle);
    }

    #[tokio::test]
    async fn password_setup_verification_does_not_sign_in() {
        let ops = MockOps::new();
        ops.script_verify(Ok(VerifyOutcome {
            credentials: None,
            payload: json!({"setup_ticket": "t-9"}),
        }));
        let (controller, session) = controller_with(ops);

        controller
            .open(OtpContext::PasswordSetup, email_target())
            .await
            .unwrap();
        let payload = controller.verify("123456").await.unwrap();

        assert_eq!(payload["setup_ticket"], json!("t-9"));
        assert_eq!(controller.state(), OtpState::Verified);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn rejected_code_enters_failed_and_allows_retry() {
        let ops = MockOps::new();
        ops.script_verify(Err(rejected_code()));
        ops.script_verify(Ok(login_outcome()));
        let (controller, session) = controller_with(ops);

        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();

        let err = controller.verify("000000").await.unwrap_err();
        assert!(matches!(err, OtpError::Verification(_)));
        assert_eq!(controller.state(), OtpState::Failed);
        assert_eq!(controller.last_error(), Some(rejected_code()));

        controller.verify("123456").await.unwrap();
        assert_eq!(controller.state(), OtpState::Verified);
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn rejected_verification_never_clears_existing_credentials() {
        let ops = MockOps::new();
        ops.script_verify(Err(FlowError {
            message: "forbidden".to_string(),
            status_code: Some(403),
        }));
        let (controller, session) = controller_with(ops);
        session
            .set_credentials(&make_token(Utc::now().timestamp() + 3600), Some(citizen()))
            .unwrap();

        controller
            .open(OtpContext::GuestComplaint, email_target())
            .await
            .unwrap();
        controller.verify("123456").await.unwrap_err();

        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn verify_without_a_flow_is_rejected() {
        let ops = MockOps::new();
        let (controller, _) = controller_with(ops);

        let err = controller.verify("123456").await.unwrap_err();
        assert!(matches!(err, OtpError::FlowClosed));
    }

    // ===== resend tests =====

    #[tokio::test]
    async fn failed_resend_leaves_the_flow_where_it_was() {
        let ops = MockOps::new();
        ops.script_verify(Err(rejected_code()));
        ops.script_resend(Err(FlowError {
            message: "mail service down".to_string(),
            status_code: Some(502),
        }));
        ops.script_verify(Ok(login_outcome()));
        let (controller, session) = controller_with(ops);

        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();
        controller.verify("000000").await.unwrap_err();
        assert_eq!(controller.state(), OtpState::Failed);

        // The resend fails; the flow stays in Failed, still usable.
        let err = controller.resend().await.unwrap_err();
        assert!(matches!(err, OtpError::Resend(_)));
        assert_eq!(controller.state(), OtpState::Failed);

        // A later resend succeeds and re-arms the flow.
        controller.resend().await.unwrap();
        assert_eq!(controller.state(), OtpState::Sent);

        controller.verify("123456").await.unwrap();
        assert!(session.is_authenticated());
    }

    // ===== cancellation and staleness tests =====

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let ops = MockOps::new();
        let (controller, _) = controller_with(ops);

        controller.cancel();
        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();
        controller.cancel();
        controller.cancel();
        assert_eq!(controller.state(), OtpState::Idle);
    }

    #[tokio::test]
    async fn session_change_callback_can_read_flow_state() {
        let ops = MockOps::new();
        ops.script_verify(Ok(login_outcome()));
        let (controller, session) = controller_with(ops);

        // Typical shell wiring: a session change triggers a re-render
        // that reads the dialog's flow state back off the controller.
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let reader = controller.clone();
        session.set_on_change(Box::new(move |_| {
            sink.lock().unwrap().push(reader.state());
        }));

        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();
        controller.verify("123456").await.unwrap();

        assert!(session.is_authenticated());
        assert_eq!(controller.state(), OtpState::Verified);
        // The callback ran mid-verify and saw the attempt in progress.
        assert_eq!(*observed.lock().unwrap(), vec![OtpState::Verifying]);
    }

    #[tokio::test]
    async fn stale_verification_outcome_is_discarded() {
        let (ops, gate) = MockOps::gated();
        ops.script_verify(Ok(login_outcome()));
        let (controller, session) = controller_with(ops);

        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();

        // Start a verify that parks inside the transport.
        let in_flight = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.verify("123456").await })
        };
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        // The user abandons the flow and starts a new one.
        controller.cancel();
        controller
            .open(OtpContext::Login, email_target())
            .await
            .unwrap();

        // The old response arrives now; it must not touch the new flow
        // or the session.
        gate.notify_one();
        let result = in_flight.await.unwrap();

        assert!(matches!(result, Err(OtpError::FlowClosed)));
        assert_eq!(controller.state(), OtpState::Sent);
        assert!(!session.is_authenticated());
    }
}
