//! skywatch-store: persistent encounter engine.
//!
//! SQLite persistence with coalesced writes, a read projection for display,
//! legacy migration, backups, and the tokio task that owns it all.

pub mod backup;
pub mod db;
pub mod drain;
pub mod engine;
pub mod error;
pub mod migration;
pub mod pipeline;
pub mod projection;
pub mod repository;

pub use db::{Database, DbStats};
pub use engine::{spawn, Engine, EngineEvent, EngineHandle};
pub use error::{Result, StoreError};
pub use migration::{MigrationReport, MigrationState};
pub use projection::{LightweightEncounter, ProjectionCache};
