//! Client driver: dial the daemon, issue one command, stream the payload,
//! report the terminal status.

use std::path::Path;

use glob::Pattern;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::archive;
use crate::crypto;
use crate::error::Result;
use crate::protocol::{self, Command, Status};

/// Pack, seal, and deploy `path` to `target` on the daemon at `addr`.
///
/// Returns the server's terminal status; refusals and failures are statuses,
/// not errors, so callers can distinguish them from local/transport faults.
pub async fn deploy(
    addr: &str,
    target: &str,
    principal: &str,
    password: &str,
    path: &Path,
    ignore: &[Pattern],
) -> Result<Status> {
    let payload = archive::pack(path, ignore)?;
    let key = crypto::derive_key(password);
    let sealed = crypto::seal(&key, &payload)?;
    debug!(bytes = sealed.len(), "payload packed and sealed");

    let mut stream = TcpStream::connect(addr).await?;
    protocol::write_command(
        &mut stream,
        &Command::Deploy {
            target: target.to_string(),
            principal: principal.to_string(),
        },
    )
    .await?;

    // The daemon acknowledges with OK before it will accept the stream;
    // anything else is already the terminal status.
    let proceed = protocol::read_status(&mut stream).await?;
    if !proceed.is_ok() {
        return Ok(proceed);
    }

    protocol::write_stream(&mut stream, &sealed).await?;
    info!(target, bytes = sealed.len(), "payload streamed");

    protocol::read_status(&mut stream).await
}

/// Liveness check: send PING, expect OK.
pub async fn ping(addr: &str) -> Result<Status> {
    let mut stream = TcpStream::connect(addr).await?;
    protocol::write_command(&mut stream, &Command::Ping).await?;
    protocol::read_status(&mut stream).await
}
