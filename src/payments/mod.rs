//! Inbound payment pipeline
//!
//! Webhooks enter through [`gateway::WebhookGateway`], which authenticates,
//! normalizes and correlates them before handing a task to the queue.

pub mod correlator;
pub mod gateway;
pub mod normalizer;
pub mod signature;
pub mod traits;
pub mod types;

pub use correlator::OrderCorrelator;
pub use gateway::{GatewayResponse, InboundWebhook, WebhookGateway};
pub use signature::{SignatureCheck, SignatureError, SignatureVerifier};
pub use traits::{ClaimedTask, OrderLookup, TaskQueue};
pub use types::{CanonicalPayment, NotificationStatus, Order, VerificationTask};
