//! # yhs-events
//!
//! Wire types for the scheduler the history collector tracks.
//!
//! ## Event Feed
//!
//! The scheduler publishes a newline-delimited JSON feed where every line is
//! one [`ChangeEvent`]. Enum fields are integer coded on the wire (the
//! upper-case names are accepted too) and unknown codes decode to an
//! `Unrecognized` variant instead of failing the line.
//!
//! ## REST Payloads
//!
//! Reconciliation reads the scheduler's REST API. The payload types in
//! [`types`] carry only the fields the collector persists; everything the
//! scheduler may omit is optional so that upserts can keep previously known
//! values.

#[macro_use]
mod macros;

mod error;
mod event;
pub mod types;

pub use error::EventError;
pub use event::*;
pub use types::*;
