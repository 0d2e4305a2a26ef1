//! The remote presence endpoint boundary.
//!
//! The endpoint exposes exactly four remote procedures: login, set
//! activity, clear activity, and disconnect notification. The concrete
//! wire transport is injected behind [`PresenceTransport`] so the
//! connection manager can be driven against fakes, and behind
//! [`TransportFactory`] so a wedged handle can be torn down and recreated
//! wholesale.

use std::future::Future;
use thiserror::Error;

use trackcast_core::types::NormalizedRecord;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("presence endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
}

/// One connection handle to the remote presence endpoint.
pub trait PresenceTransport: Send {
    fn login(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn set_activity(
        &mut self,
        record: &NormalizedRecord,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn clear_activity(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drain the disconnect flag: `true` if the endpoint reported a
    /// disconnect since the last call. Checking resets the flag.
    fn take_disconnect(&mut self) -> bool;
}

/// Creates fresh transport handles. Used on startup and whenever the
/// connection manager decides the current handle is beyond salvage.
pub trait TransportFactory: Send {
    type Transport: PresenceTransport;

    fn create(&self) -> Self::Transport;
}
