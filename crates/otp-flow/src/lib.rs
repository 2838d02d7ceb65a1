//! One-time-passcode verification flows for the civic portal.
//!
//! Four contexts (login, registration, guest complaint, password
//! setup) share one explicit state machine and one controller. What a
//! context may do, and whether a verified code signs the user in, is
//! declared in the capability table rather than scattered through
//! conditionals.

mod context;
mod controller;
mod machine;
mod ops;

pub use context::{default_context_table, OtpContext, OtpContextSpec};
pub use controller::{OtpError, OtpFlowController, OtpResult};
pub use machine::{OtpMachine, OtpMachineInput, OtpMachineState, OtpState};
pub use ops::{FlowError, OtpOperations, TransportOtpOperations, VerifyOutcome};
