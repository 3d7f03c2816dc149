//! Persistence, locking, and shared data model for the Cocoon micro-VM
//! engine.
//!
//! Every other Cocoon crate depends on this one for: the path-scoped
//! [`lock::Locker`] (C1), the generic [`store::Store`] (C2), the
//! [`digest::Digest`] content-addressing type, the cross-module data model
//! ([`model`]), the shared [`error::Error`] taxonomy, [`config::Config`],
//! and detached-process helpers ([`process`]).

pub mod config;
pub mod digest;
pub mod error;
pub mod lock;
pub mod model;
pub mod process;
pub mod singleflight;
pub mod store;

pub use digest::Digest;
pub use error::{Error, Result};
pub use lock::Locker;
pub use singleflight::SingleFlight;
pub use store::{Document, Store, atomic_write, atomic_write_json};
