//! dcontrol - rollback-capable remote deployment controller.
//!
//! A client packs a file or directory into an archive, seals it with the
//! operator's shared secret, and streams it to a daemon on the target host.
//! The daemon authenticates and authorizes the request, atomically replaces
//! the target's artifact, runs lifecycle hooks, and rolls back to the prior
//! version if activation or the after-hook fails.

pub mod archive;
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod protocol;

pub use error::{DeployError, Result};
