//! skywatch-core: Pure correlation logic for drone detection telemetry.
//!
//! No async and no storage here, only the algorithms: identity resolution,
//! flight path decimation, proximity buffering, activity windows, cached
//! aggregates. `skywatch-store` wires them into a persistent engine.

pub mod activity;
pub mod aggregate;
pub mod config;
pub mod decimate;
pub mod identity;
pub mod message;
pub mod proximity;
pub mod types;

// Re-export commonly used types at crate root
pub use identity::{IdentityKeys, IdentityLookup, IdentityResolver, Resolution, ResolvedBy};
pub use message::{DetectionMessage, IdType, ObserverStatus, SignalSource};
pub use types::*;
