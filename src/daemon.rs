//! Session daemon: accepts connections and services each one in its own
//! task. A failure in one session never takes the listener down, and every
//! session is answered with exactly one terminal status.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::auth::{self, Authority};
use crate::config::Config;
use crate::crypto;
use crate::engine::Engine;
use crate::error::{DeployError, Result};
use crate::protocol::{self, Command, Status};

pub struct Daemon {
    listener: TcpListener,
    config: Arc<Config>,
    authority: Arc<Authority>,
    engine: Arc<Engine>,
}

impl Daemon {
    pub async fn bind(config: Arc<Config>, addr: &str) -> anyhow::Result<Daemon> {
        tokio::fs::create_dir_all(&config.backup_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create backup directory {}",
                    config.backup_dir.display()
                )
            })?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        Ok(Daemon {
            authority: Arc::new(Authority::from_config(&config)),
            engine: Arc::new(Engine::new(config.clone())),
            config,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let config = self.config.clone();
            let authority = self.authority.clone();
            let engine = self.engine.clone();
            tokio::spawn(async move {
                handle_session(stream, peer, config, authority, engine).await;
            });
        }
    }
}

async fn handle_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    authority: Arc<Authority>,
    engine: Arc<Engine>,
) {
    debug!(%peer, "session started");
    match session(&mut stream, &config, &authority, &engine).await {
        Ok(()) => debug!(%peer, "session finished"),
        Err(DeployError::ConnectionClosed) => debug!(%peer, "client disconnected"),
        Err(err) => warn!(%peer, error = %err, "session failed"),
    }
}

async fn session(
    stream: &mut TcpStream,
    config: &Config,
    authority: &Authority,
    engine: &Engine,
) -> Result<()> {
    match protocol::read_command(stream).await? {
        Command::Ping => protocol::write_status(stream, &Status::Ok).await,
        Command::Unknown(opcode) => {
            debug!(opcode, "unsupported command");
            protocol::write_status(
                stream,
                &Status::Unsupported(format!("command 0x{opcode:02x} is unsupported")),
            )
            .await
        }
        Command::Deploy { target, principal } => {
            deploy_session(stream, config, authority, engine, &target, &principal).await
        }
    }
}

async fn deploy_session(
    stream: &mut TcpStream,
    config: &Config,
    authority: &Authority,
    engine: &Engine,
    target_name: &str,
    principal_name: &str,
) -> Result<()> {
    let (target, principal) = match auth::gate(config, authority, principal_name, target_name) {
        Ok(gated) => gated,
        Err(err) => {
            warn!(
                target_name,
                principal = principal_name,
                error = %err,
                "deployment refused"
            );
            return protocol::write_status(stream, &status_for(&err)).await;
        }
    };

    // Acknowledge the command; the client streams the payload next.
    protocol::write_status(stream, &Status::Ok).await?;

    let sealed = match protocol::read_stream(stream).await {
        Ok(payload) => payload,
        // Cancellation: the peer is gone, there is nobody to answer.
        Err(DeployError::ConnectionClosed) => return Err(DeployError::ConnectionClosed),
        Err(err) => {
            warn!(
                target_name,
                principal = %principal.name,
                error = %err,
                "transfer failed"
            );
            return protocol::write_status(stream, &status_for(&err)).await;
        }
    };
    info!(
        target_name,
        principal = %principal.name,
        bytes = sealed.len(),
        "payload received"
    );

    let key = crypto::derive_key(&principal.password);
    match engine.deploy(target, &key, &sealed).await {
        Ok(()) => protocol::write_status(stream, &Status::Ok).await,
        Err(err) => {
            error!(
                target_name,
                principal = %principal.name,
                error = %err,
                "deployment failed"
            );
            protocol::write_status(stream, &status_for(&err)).await
        }
    }
}

/// Map an error onto its wire status. Authentication and authorization
/// failures are BLOCKED (never NOT_OK) and a missing target is NOT_EXIST,
/// so client tooling can tell refusals from transient failures.
pub fn status_for(err: &DeployError) -> Status {
    match err {
        DeployError::Unauthenticated | DeployError::Unauthorized { .. } => {
            Status::Blocked(err.to_string())
        }
        DeployError::NoSuchTarget(_) => Status::NotExist(err.to_string()),
        other => Status::NotOk(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_map_to_blocked() {
        assert_eq!(status_for(&DeployError::Unauthenticated).code(), 3);
        assert_eq!(
            status_for(&DeployError::Unauthorized {
                principal: "bob".to_string(),
                target: "app".to_string(),
            })
            .code(),
            3
        );
    }

    #[test]
    fn missing_target_maps_to_not_exist() {
        assert_eq!(
            status_for(&DeployError::NoSuchTarget("app".to_string())).code(),
            4
        );
    }

    #[test]
    fn other_failures_map_to_not_ok() {
        let err = DeployError::Hook {
            command: "false".to_string(),
            reason: "exit status 1".to_string(),
        };
        let status = status_for(&err);
        assert_eq!(status.code(), 1);
        assert!(status.message().contains("hook"));
    }
}
