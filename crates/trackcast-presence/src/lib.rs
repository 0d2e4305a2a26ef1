//! trackcast-presence: the companion-process side of the pipeline.
//!
//! Owns the single fragile connection to the remote presence endpoint,
//! reconciles incoming records against the last state believed pushed, and
//! commits played tracks to an append-only history log under the dwell
//! rule.

pub mod connection;
pub mod history;
pub mod reconcile;
pub mod transport;
