//! Payment webhook verification and payout lifecycle service
//!
//! Inbound provider webhooks are authenticated, normalized and correlated to
//! orders by [`payments`], verified asynchronously by [`workers`], and drive
//! the payout lifecycle in [`payout`]. Everything noteworthy lands in the
//! [`audit`] trail.

pub mod api;
pub mod audit;
#[cfg(feature = "cache")]
pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod lock;
pub mod notifications;
pub mod payments;
pub mod payout;
pub mod workers;

pub use error::{AppError, AppResult};
