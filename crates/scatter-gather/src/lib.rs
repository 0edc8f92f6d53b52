//! A durable scatter-gather coordination gateway.
//!
//! Tracks progress of a logical operation split into many independently
//! completing parts, and fires a single completion callback exactly once
//! when every part reports in. State lives behind a [`Persistence`]
//! implementation so coordination survives process restarts and works
//! across a distributed worker pool. The store is shared memory; the value
//! here is the protocol in [`Gateway`].

mod error;
mod gateway;
mod ids;
mod port;

pub mod backends;

pub use error::Error;
pub use gateway::Gateway;
pub use ids::{PartId, RequestId};
pub use port::{ClaimOutcome, Persistence};
