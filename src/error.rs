//! Error taxonomy for the deployment pipeline.
//!
//! Every failure a session can hit maps onto exactly one wire status (see
//! `daemon::status_for`). Errors raised before activation leave no durable
//! side effect on the target host.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Peer closed the connection cleanly mid-session. Treated as
    /// cancellation, not corruption.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// I/O failure while streaming the payload.
    #[error("transmission failed: {0}")]
    Transmission(#[source] io::Error),

    /// The submitted credential matched no known principal.
    #[error("credential was not accepted")]
    Unauthenticated,

    /// The principal resolved but lacks permission for the target.
    #[error("{principal} is not permitted to deploy target {target}")]
    Unauthorized { principal: String, target: String },

    #[error("target {0} does not exist")]
    NoSuchTarget(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// Authenticated decryption of the payload failed: wrong password or a
    /// tampered ciphertext.
    #[error("payload could not be decrypted")]
    Sealed,

    /// A lifecycle hook spawned but exited non-zero, or failed to spawn.
    #[error("hook `{command}` failed: {reason}")]
    Hook { command: String, reason: String },

    #[error("failed to back up the current artifact: {0}")]
    Backup(#[source] io::Error),

    /// Rollback itself failed. Nothing further is attempted automatically;
    /// the message is surfaced verbatim to the operator.
    #[error("restore failed while {context}; manual attention required")]
    RestoreFailed { context: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
