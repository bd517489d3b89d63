//! `fleet-core`: pieces shared by every crate in the workspace.
//!
//! - [`config`]: `fleet.toml` + `FLEET_*` environment loading.
//! - [`error`]: the error taxonomy ([`ErrorKind`]) every crate maps onto.
//! - [`db`]: the shared SQLite connection and transaction helper.
//! - [`types`]: paging types used by the stores.

pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use error::{ErrorKind, FleetError, Result};
pub use types::{PageRequest, Pager};
