//! meshsub core library
//!
//! Value types shared by every meshsub crate: node and handle identities,
//! acknowledgement labels, message envelopes, and the canonical encoding used
//! on the wire.
//!
//! # Modules
//!
//! - [`types`]: identities, envelopes, filters, acknowledgements
//! - [`label`]: acknowledgement label grammar and resolution checks
//! - [`identity`]: domain-separated identity derivations
//! - [`canonical`]: deterministic postcard encoding
//! - [`error`]: error types

pub mod canonical;
pub mod error;
pub mod identity;
pub mod label;
pub mod types;

pub use error::{Error, Result};
pub use label::AckLabel;
pub use types::*;
