//! Hub collaborator interface.
//!
//! The hub is the central service storing the canonical changeset chain,
//! checkpoints, issued briefcase ids and code/lock reservations. This crate
//! only consumes it; the concrete transport is chosen at process init and
//! injected into [`crate::briefcase::BriefcaseManager`].

mod types;
pub use types::*;

mod client;
pub use client::*;
