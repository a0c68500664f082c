//! Berth core library — persistent session & port registry.
//!
//! Public API surface:
//! - [`store`] — [`Store`] open / close over one SQLite file
//! - [`schema`] — generation detection and legacy migration
//! - [`sessions`] — session CRUD with soft delete
//! - [`ports`] — optimistic port allocation, [`PortProbe`]
//! - [`reservations`] — operator-withheld ports
//! - [`config`] — `~/.berth/config.yaml`
//! - [`types`] — newtypes and domain structs
//! - [`error`] — [`RegistryError`]

pub mod config;
pub mod error;
pub mod ports;
pub mod reservations;
pub mod schema;
pub mod sessions;
pub mod store;
pub mod types;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use ports::{OsPortProbe, PortProbe, MAX_ALLOCATION_ATTEMPTS};
pub use schema::{MigrationReport, SchemaGeneration};
pub use store::Store;
pub use types::{
    NewSession, PortAllocation, PortRange, Reservation, SessionId, SessionMode, SessionRow,
};
