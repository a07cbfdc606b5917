//! Background workers

pub mod verification_worker;

pub use verification_worker::{TaskOutcome, VerificationConfig, VerificationWorker};
