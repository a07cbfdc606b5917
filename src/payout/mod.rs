//! Payout lifecycle
//!
//! [`state`] holds the lifecycle graph, [`machine`] applies transitions,
//! [`reaper`] recovers payouts that never settle and [`delivery`] gates the
//! physical handover behind a one-time code.

pub mod delivery;
pub mod machine;
pub mod reaper;
pub mod state;

pub use delivery::{DeliveryGate, DeliveryOtp, OtpIssuer};
pub use machine::{PayoutStateMachine, TransitionError, TransitionOutcome};
pub use reaper::{ReapRun, ReaperConfig, StalePayoutReaper};
pub use state::{Payout, PayoutStatus, TransitionAuthority};
