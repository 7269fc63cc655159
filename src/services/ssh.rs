//! SSH transport: a connector that opens one authenticated session per call,
//! and the session handle used to run commands on it.

use crate::error::{MonitorError, Result};
use crate::models::server::{ConnectionTarget, Credential};
use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }
}

/// An open, authenticated remote shell session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Runs one command on a fresh channel of this session.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Disconnects the session. Safe to call once on every exit path.
    async fn close(&self);
}

/// Opens sessions. One call, one session; nothing is cached.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn RemoteSession>>;
}

/// russh-backed connector.
pub struct SshConnector {
    connect_timeout: Duration,
    inactivity_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, inactivity_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            inactivity_timeout,
        }
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        target: &ConnectionTarget,
    ) -> Result<bool> {
        let auth = match &target.credential {
            Credential::Password(password) => {
                tokio::time::timeout(
                    self.connect_timeout,
                    handle.authenticate_password(target.username.clone(), password.clone()),
                )
                .await
                .map_err(|_| MonitorError::Timeout(self.connect_timeout.as_secs()))??
            }
            Credential::PrivateKey(pem) => {
                let key = russh::keys::decode_secret_key(pem, None)
                    .map_err(|e| MonitorError::connection(format!("Cannot parse privateKey: {}", e)))?;
                let rsa_hash = tokio::time::timeout(self.connect_timeout, handle.best_supported_rsa_hash())
                    .await
                    .map_err(|_| MonitorError::Timeout(self.connect_timeout.as_secs()))??
                    .flatten();
                tokio::time::timeout(
                    self.connect_timeout,
                    handle.authenticate_publickey(
                        target.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
                    ),
                )
                .await
                .map_err(|_| MonitorError::Timeout(self.connect_timeout.as_secs()))??
            }
        };
        Ok(auth.success())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn RemoteSession>> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            ..Default::default()
        });

        debug!("Opening SSH session to {}@{}:{}", target.username, target.hostname, target.port);
        let addr = (target.hostname.as_str(), target.port);
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, addr, ClientHandler),
        )
        .await
        .map_err(|_| MonitorError::Timeout(self.connect_timeout.as_secs()))?
        .map_err(|e| match e {
            russh::Error::IO(io) => MonitorError::connection(io.to_string()),
            other => MonitorError::Ssh(other),
        })?;

        if !self.authenticate(&mut handle, target).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(MonitorError::Authentication);
        }

        Ok(Box::new(SshSession { handle }))
    }
}

struct SshSession {
    handle: client::Handle<ClientHandler>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        // Killed by a signal: the channel closes without an exit status.
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.unwrap_or(-1),
        })
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "poll complete", "en")
            .await;
    }
}

/// Host keys are accepted as presented; records carry no fingerprint to pin.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}
