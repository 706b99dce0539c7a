//! Transport traits and the bounded connect loop

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use winnode_common::metrics::record_connect_attempt;
use winnode_common::{poll_bounded, Error, PollConfig, PollError, Result};

/// Key material used to authenticate against a host
#[derive(Clone)]
pub struct Credential {
    private_key_pem: Zeroizing<String>,
}

impl Credential {
    /// Wrap a PEM/OpenSSH encoded private key
    pub fn from_private_key_pem(pem: impl Into<String>) -> Self {
        Self {
            private_key_pem: Zeroizing::new(pem.into()),
        }
    }

    /// The encoded private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Where and as whom to connect
#[derive(Clone, Debug)]
pub struct ConnectTarget {
    /// IPv4/IPv6 address or hostname
    pub address: String,
    /// Remote user
    pub username: String,
    /// Authentication material
    pub credential: Credential,
}

impl ConnectTarget {
    /// Build a target, rejecting empty fields up front
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        credential: Credential,
    ) -> Result<Self> {
        let address = address.into();
        let username = username.into();
        if address.is_empty() {
            return Err(Error::input_for_field("address", "address cannot be empty"));
        }
        if username.is_empty() {
            return Err(Error::input_for_field(&address, "username cannot be empty"));
        }
        if credential.private_key_pem().is_empty() {
            return Err(Error::input_for_field(&address, "private key cannot be empty"));
        }
        Ok(Self {
            address,
            username,
            credential,
        })
    }
}

/// Opens sessions to remote hosts
///
/// `dial` makes exactly one attempt. It must return [`Error::Authentication`]
/// when the host rejects the credential and [`Error::Connectivity`] for any
/// failure that might clear up by waiting.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt
    async fn dial(&self, target: &ConnectTarget) -> Result<Box<dyn Session>>;
}

/// An established channel to one host
///
/// Owned by a single reconcile pass. Neither `run` nor `transfer` retries;
/// callers re-attempt at reconcile granularity.
#[async_trait]
pub trait Session: Send {
    /// Address this session is connected to
    fn address(&self) -> &str;

    /// Run `command` and return its combined stdout and stderr.
    ///
    /// A non-zero exit yields [`Error::RemoteExecution`] carrying the output.
    /// A channel that closes before any exit status yields
    /// [`Error::ChannelClosed`].
    async fn run(&mut self, command: &str) -> Result<String>;

    /// Stream `reader` into `remote_dir\filename`, creating `remote_dir` if
    /// needed. Returns only once the remote file is flushed and closed.
    async fn transfer(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        filename: &str,
        remote_dir: &str,
    ) -> Result<()>;

    /// Release the session. Failures are logged, never returned.
    async fn close(self: Box<Self>);
}

/// Join a Windows remote directory and a file name
pub fn remote_path(remote_dir: &str, filename: &str) -> String {
    format!("{}\\{}", remote_dir.trim_end_matches(['\\', '/']), filename)
}

/// Transfer an in-memory buffer
pub async fn transfer_bytes(
    session: &mut dyn Session,
    contents: &[u8],
    filename: &str,
    remote_dir: &str,
) -> Result<()> {
    let mut reader = contents;
    session.transfer(&mut reader, filename, remote_dir).await
}

/// Connect to `target`, retrying transient failures every `poll.interval`
/// until `poll.timeout`.
///
/// The host may still be running its first-boot provisioning, so refused and
/// reset connections are expected for a while. A rejected credential ends the
/// loop at once with [`Error::Authentication`].
pub async fn connect(
    connector: &dyn Connector,
    target: &ConnectTarget,
    poll: &PollConfig,
    cancel: &CancellationToken,
) -> Result<Box<dyn Session>> {
    let description = format!("connect {}", target.address);

    let outcome = poll_bounded(
        poll,
        cancel,
        &description,
        Error::is_authentication,
        move || async move {
            match connector.dial(target).await {
                Ok(session) => {
                    record_connect_attempt("success");
                    Ok(Some(session))
                }
                Err(e) if e.is_authentication() => {
                    record_connect_attempt("auth_rejected");
                    warn!(address = %target.address, error = %e, "credential rejected by host");
                    Err(e)
                }
                Err(e) => {
                    record_connect_attempt("transient");
                    debug!(address = %target.address, error = %e, "connection attempt failed");
                    Err(e)
                }
            }
        },
    )
    .await;

    match outcome {
        Ok(session) => {
            info!(address = %target.address, "connected to host");
            Ok(session)
        }
        Err(PollError::Aborted(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::cancelled(description)),
        Err(PollError::TimedOut { last_error, .. }) => Err(Error::connect_timeout(
            &target.address,
            poll.timeout,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no successful attempt".to_string()),
        )),
    }
}
