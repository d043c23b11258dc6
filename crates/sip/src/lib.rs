#![forbid(unsafe_code)]
//! SIAL block store public API facade.
//!
//! Re-exports block identity from `sip-types`, the worker-side block maps
//! from `sip-block`, the disk-backed server map from `sip-server` and the
//! shared error type from `sip-error`. Interpreters and server loops depend
//! on this crate only.

pub use sip_block::*;
pub use sip_error::{ErrorClass, Result, SipError};
pub use sip_server::*;
pub use sip_types::*;
