//! One-time-passcode flow state machine using rust-fsm.
//!
//! Every OTP context (login, registration, guest complaint, password
//! setup) drives the same machine; the differences between contexts
//! live in the capability table, not in the states.
//!
//! ## State Diagram
//!
//! ```text
//! ┌──────────┐
//! │   Idle   │ (initial)
//! └────┬─────┘
//!      │ Opened (code sent)
//!      ▼
//! ┌──────────┐  ResendRequested  ┌──────────┐
//! │   Sent   │ ◄──────────────── │  Failed  │
//! └────┬─────┘                   └────▲─────┘
//!      │ VerifyAttempt                │ VerifyFailed
//!      ▼                              │
//! ┌──────────┐ ────────────────────────┘
//! │Verifying │
//! └────┬─────┘
//!      │ VerifySucceeded
//!      ▼
//! ┌──────────┐  Completed
//! │ Verified │ ───────────► Idle
//! └──────────┘
//! ```
//!
//! `Cancelled` returns to `Idle` from `Sent` and `Failed`. A verify
//! already on the wire cannot be cancelled mid-transition; the
//! controller discards its outcome by generation instead.

use rust_fsm::*;
use serde::{Deserialize, Serialize};

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub otp_machine(Idle)

    Idle => {
        Opened => Sent
    },
    Sent => {
        VerifyAttempt => Verifying,
        ResendRequested => Sent,
        Cancelled => Idle
    },
    Verifying => {
        VerifySucceeded => Verified,
        VerifyFailed => Failed
    },
    Verified => {
        Completed => Idle
    },
    Failed => {
        VerifyAttempt => Verifying,
        ResendRequested => Sent,
        Cancelled => Idle
    }
}

pub use otp_machine::Input as OtpMachineInput;
pub use otp_machine::State as OtpMachineState;
pub use otp_machine::StateMachine as OtpMachine;

/// Flow state exposed to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpState {
    /// No flow in progress.
    Idle,
    /// Code delivered, waiting for the user to type it.
    Sent,
    /// A verify request is on the wire.
    Verifying,
    /// The server accepted the code.
    Verified,
    /// The last verify attempt was rejected.
    Failed,
}

impl OtpState {
    /// True in the states that accept a verify attempt.
    pub fn can_verify(&self) -> bool {
        matches!(self, OtpState::Sent | OtpState::Failed)
    }

    /// True in the states that accept a resend request.
    pub fn can_resend(&self) -> bool {
        matches!(self, OtpState::Sent | OtpState::Failed)
    }
}

impl From<&OtpMachineState> for OtpState {
    fn from(state: &OtpMachineState) -> Self {
        match state {
            OtpMachineState::Idle => OtpState::Idle,
            OtpMachineState::Sent => OtpState::Sent,
            OtpMachineState::Verifying => OtpState::Verifying,
            OtpMachineState::Verified => OtpState::Verified,
            OtpMachineState::Failed => OtpState::Failed,
        }
    }
}
