//! Scripted in-memory transport for tests
//!
//! [`ScriptedConnector`] replays a queue of dial outcomes and hands out
//! sessions onto [`FakeHost`]s, which keep an in-memory file system and a log
//! of every command run against them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use winnode_common::{Error, Result};

use crate::session::{remote_path, ConnectTarget, Connector, Session};

/// Decides the output of a command given the host's current files.
/// `Err(output)` means the command exited non-zero.
pub type Responder =
    Arc<dyn Fn(&str, &BTreeMap<String, String>) -> std::result::Result<String, String> + Send + Sync>;

/// Outcome of one scripted dial
#[derive(Clone, Debug)]
pub enum DialOutcome {
    /// Connect to the registered host
    Connect,
    /// Fail with a transient connectivity error
    Transient(String),
    /// Fail with a credential rejection
    Reject(String),
}

#[derive(Default)]
struct FakeHostState {
    files: BTreeMap<String, String>,
    commands: Vec<String>,
    responder: Option<Responder>,
    fail_transfers: bool,
    /// Commands containing this text drop the channel without an exit status
    drop_channel_on: Option<String>,
    closed_sessions: u32,
}

/// An in-memory Windows host
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeHostState>>,
}

impl FakeHost {
    /// Create an empty host that answers every command with empty output
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeHostState> {
        self.state.lock().expect("fake host mutex should not be poisoned")
    }

    /// Seed a file
    pub fn with_file(self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.lock().files.insert(path.into(), contents.into());
        self
    }

    /// Install a command responder
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str, &BTreeMap<String, String>) -> std::result::Result<String, String>
            + Send
            + Sync
            + 'static,
    {
        self.lock().responder = Some(Arc::new(responder));
        self
    }

    /// Make every transfer fail mid-copy
    pub fn set_fail_transfers(&self, fail: bool) {
        self.lock().fail_transfers = fail;
    }

    /// Drop the channel, without an exit status, on any command containing
    /// `pattern`. The command is still logged.
    pub fn with_channel_dropped_on(self, pattern: impl Into<String>) -> Self {
        self.lock().drop_channel_on = Some(pattern.into());
        self
    }

    /// Contents of a file, if present
    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// Every command run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of sessions closed against this host
    pub fn closed_sessions(&self) -> u32 {
        self.lock().closed_sessions
    }
}

/// Connector replaying scripted dial outcomes
///
/// Once the script is exhausted every dial behaves as [`DialOutcome::Connect`].
/// Connecting to an address with no registered host is a transient failure.
#[derive(Default)]
pub struct ScriptedConnector {
    hosts: Mutex<HashMap<String, FakeHost>>,
    script: Mutex<VecDeque<DialOutcome>>,
    dials: AtomicU32,
}

impl ScriptedConnector {
    /// Create a connector with no hosts
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host reachable at `address`
    pub fn with_host(self, address: impl Into<String>, host: FakeHost) -> Self {
        self.hosts
            .lock()
            .expect("hosts mutex should not be poisoned")
            .insert(address.into(), host);
        self
    }

    /// Queue dial outcomes
    pub fn with_dials(self, outcomes: impl IntoIterator<Item = DialOutcome>) -> Self {
        self.script
            .lock()
            .expect("script mutex should not be poisoned")
            .extend(outcomes);
        self
    }

    /// Number of dials attempted so far
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn dial(&self, target: &ConnectTarget) -> Result<Box<dyn Session>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .expect("script mutex should not be poisoned")
            .pop_front()
            .unwrap_or(DialOutcome::Connect);

        match outcome {
            DialOutcome::Transient(msg) => Err(Error::connectivity(&target.address, msg)),
            DialOutcome::Reject(msg) => Err(Error::authentication(&target.address, msg)),
            DialOutcome::Connect => {
                let host = self
                    .hosts
                    .lock()
                    .expect("hosts mutex should not be poisoned")
                    .get(&target.address)
                    .cloned()
                    .ok_or_else(|| Error::connectivity(&target.address, "no route to host"))?;
                Ok(Box::new(FakeSession {
                    address: target.address.clone(),
                    host,
                }))
            }
        }
    }
}

struct FakeSession {
    address: String,
    host: FakeHost,
}

#[async_trait]
impl Session for FakeSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run(&mut self, command: &str) -> Result<String> {
        let mut state = self.host.lock();
        state.commands.push(command.to_string());
        if state
            .drop_channel_on
            .as_deref()
            .is_some_and(|pattern| command.contains(pattern))
        {
            return Err(Error::channel_closed(&self.address, command, ""));
        }
        let result = match &state.responder {
            Some(responder) => responder(command, &state.files),
            None => Ok(String::new()),
        };
        result.map_err(|output| {
            Error::remote_execution(&self.address, command, output, "exit status 1")
        })
    }

    async fn transfer(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        filename: &str,
        remote_dir: &str,
    ) -> Result<()> {
        let path = remote_path(remote_dir, filename);
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.map_err(|e| {
            Error::remote_execution(&self.address, &path, "", format!("read failed: {e}"))
        })?;

        let mut state = self.host.lock();
        if state.fail_transfers {
            return Err(Error::remote_execution(
                &self.address,
                &path,
                "",
                "connection lost mid-copy",
            ));
        }
        state.files.insert(path, contents);
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.host.lock().closed_sessions += 1;
    }
}
