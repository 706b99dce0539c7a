//! Key-based SSH transport with SFTP file copy
//!
//! Windows hosts run OpenSSH server. Commands execute through an `exec`
//! channel, files are copied over the `sftp` subsystem.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, error, warn};

use winnode_common::{Error, Result};

use crate::session::{remote_path, ConnectTarget, Connector, Session};

/// Default SSH port
pub const SSH_PORT: u16 = 22;

/// Upper bound on a single TCP connect + handshake + auth attempt
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts any host key.
///
/// Hosts are freshly provisioned VMs whose keys are not known in advance.
struct HostKeyAcceptor;

#[async_trait]
impl client::Handler for HostKeyAcceptor {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Production [`Connector`] over SSH
pub struct SshConnector {
    config: Arc<client::Config>,
    port: u16,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(SSH_PORT)
    }
}

impl SshConnector {
    /// Create a connector targeting `port`
    pub fn new(port: u16) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            port,
        }
    }

    async fn dial_once(&self, target: &ConnectTarget) -> Result<Handle<HostKeyAcceptor>> {
        let address = &target.address;

        // A key that cannot be decoded is a credential problem: no amount of
        // waiting will make the host accept it.
        let key_pair = russh_keys::decode_secret_key(target.credential.private_key_pem(), None)
            .map_err(|e| Error::authentication(address, format!("unusable private key: {e}")))?;

        let mut handle = client::connect(
            self.config.clone(),
            (address.as_str(), self.port),
            HostKeyAcceptor,
        )
        .await
        .map_err(|e| Error::connectivity(address, e.to_string()))?;

        let accepted = handle
            .authenticate_publickey(target.username.as_str(), Arc::new(key_pair))
            .await
            .map_err(|e| Error::connectivity(address, format!("authentication exchange: {e}")))?;

        if !accepted {
            return Err(Error::authentication(
                address,
                format!("public key for user {} was rejected", target.username),
            ));
        }
        Ok(handle)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn dial(&self, target: &ConnectTarget) -> Result<Box<dyn Session>> {
        let handle = tokio::time::timeout(DIAL_TIMEOUT, self.dial_once(target))
            .await
            .map_err(|_| {
                Error::connectivity(&target.address, format!("dial timed out after {DIAL_TIMEOUT:?}"))
            })??;

        Ok(Box::new(SshSession {
            address: target.address.clone(),
            handle,
        }))
    }
}

/// An authenticated SSH connection to one host
pub struct SshSession {
    address: String,
    handle: Handle<HostKeyAcceptor>,
}

impl SshSession {
    fn exec_error(&self, command: &str, e: impl std::fmt::Display) -> Error {
        Error::remote_execution(&self.address, command, "", e.to_string())
    }

    async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.exec_error("sftp", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.exec_error("sftp", e))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.exec_error("sftp", e))
    }

    /// Create every missing component of `remote_dir`
    async fn create_dir_all(&self, sftp: &SftpSession, remote_dir: &str) -> Result<()> {
        let mut current = String::new();
        for component in remote_dir.split(['\\', '/']).filter(|c| !c.is_empty()) {
            if !current.is_empty() {
                current.push('\\');
            }
            current.push_str(component);

            let exists = sftp
                .try_exists(current.as_str())
                .await
                .map_err(|e| self.exec_error(&current, e))?;
            if !exists {
                debug!(address = %self.address, dir = %current, "creating remote directory");
                sftp.create_dir(current.as_str()).await.map_err(|e| {
                    self.exec_error(&current, format!("error creating remote directory: {e}"))
                })?;
            }
        }
        Ok(())
    }

    async fn copy(
        &self,
        sftp: &SftpSession,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        filename: &str,
        remote_dir: &str,
    ) -> Result<()> {
        self.create_dir_all(sftp, remote_dir).await?;

        let remote_file = remote_path(remote_dir, filename);
        let mut file = sftp
            .create(remote_file.as_str())
            .await
            .map_err(|e| self.exec_error(&remote_file, format!("error creating file: {e}")))?;

        tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| self.exec_error(&remote_file, format!("error copying {filename}: {e}")))?;

        // Transferred binaries and scripts are executed right after; the
        // handle must be flushed and closed before we report success.
        file.flush()
            .await
            .map_err(|e| self.exec_error(&remote_file, format!("error flushing: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| self.exec_error(&remote_file, format!("error closing: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Session for SshSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run(&mut self, command: &str) -> Result<String> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.exec_error(command, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.exec_error(command, e))?;

        let mut output: Vec<u8> = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        // The server usually closes the channel once the command exits
        if let Err(e) = channel.close().await {
            debug!(address = %self.address, error = %e, "channel already closed");
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        match exit_status {
            Some(0) => Ok(output),
            Some(code) => Err(Error::remote_execution(
                &self.address,
                command,
                output,
                format!("exit status {code}"),
            )),
            None => Err(Error::channel_closed(&self.address, command, output)),
        }
    }

    async fn transfer(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        filename: &str,
        remote_dir: &str,
    ) -> Result<()> {
        let sftp = self.open_sftp().await?;
        let result = self.copy(&sftp, reader, filename, remote_dir).await;
        if let Err(e) = sftp.close().await {
            error!(address = %self.address, error = %e, "error closing SFTP session");
        }
        result
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(address = %self.address, error = %e, "error closing SSH connection");
        }
    }
}
