//! Instance reconciliation
//!
//! One pass brings one managed host to the running version: compute the
//! lifecycle state, consult the upgrade gate when the host was configured by
//! another version, run the remote configuration, and record the result as
//! Node annotations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::runtime::events::EventType;
use kube::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use winnode_common::events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};
use winnode_common::metrics::record_reconcile;
use winnode_common::{
    poll_bounded, Error, PollError, Result, TRUST_BUNDLE_HASH_ANNOTATION, VERSION_ANNOTATION,
};
use winnode_transport::{connect, ConnectTarget, Connector, Credential, Session, SshConnector};

use crate::annotations::{build_add_patch, build_remove_patch, PatchDocument};
use crate::config::ControllerConfig;
use crate::convergence::{target_bundle, RotationPhase};
use crate::instances::{
    build_records, lifecycle_state, parse_instance_entries, InstanceRecord, LifecycleState, NodeRef,
};
use crate::kube_store::{KubeClusterStore, KubeVolumeStats, SecretCredentialProvider};
use crate::upgrade_gate::{upgrade_blocked, LiveVolume};

/// Name used when reporting Kubernetes Events
pub const CONTROLLER_NAME: &str = "winnode-operator";

/// Cluster object store operations the controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Raw data of the instance inventory ConfigMap
    async fn list_instance_entries(&self) -> Result<BTreeMap<String, String>>;

    /// All Nodes labelled as Windows
    async fn list_windows_nodes(&self) -> Result<Vec<Node>>;

    /// Get a Node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Find the Windows Node reporting `address` in its status
    async fn find_node_by_address(&self, address: &str) -> Result<Option<Node>>;

    /// Apply an annotation patch document atomically
    async fn patch_node_annotations(&self, name: &str, patch: &PatchDocument) -> Result<()>;

    /// Authoritative trust bundle PEM, if published
    async fn get_trust_bundle(&self) -> Result<Option<String>>;

    /// Last bundle every managed host converged on
    async fn get_converged_bundle(&self) -> Result<Option<String>>;

    /// Persist the bundle every managed host converged on
    async fn put_converged_bundle(&self, pem: &str) -> Result<()>;

    /// Bundle of a rotation that has not reached every host yet
    async fn get_pending_bundle(&self) -> Result<Option<String>>;

    /// Persist the bundle of a rotation before it is pushed to hosts
    async fn put_pending_bundle(&self, pem: &str) -> Result<()>;

    /// Forget the pending bundle once every host converged
    async fn clear_pending_bundle(&self) -> Result<()>;
}

/// Source of live pod volume usage per node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeStatsSource: Send + Sync {
    /// Volumes currently mounted by pods on `node`
    async fn live_volumes(&self, node: &str) -> Result<Vec<LiveVolume>>;
}

/// Supplies the key used to authenticate against hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential
    async fn credential(&self) -> Result<Credential>;
}

/// Outcome of a successful reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Host was configured and annotated with the running version
    Configured,
    /// Host was already configured by the running version
    AlreadyUpToDate,
    /// Upgrade deferred until in-tree volumes are released
    UpgradeBlocked,
}

impl ReconcileOutcome {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::AlreadyUpToDate => "up_to_date",
            Self::UpgradeBlocked => "upgrade_blocked",
        }
    }
}

/// Shared state for reconcile and convergence passes
pub struct Context {
    /// Cluster object store
    pub store: Arc<dyn ClusterStore>,
    /// Live volume usage
    pub volumes: Arc<dyn VolumeStatsSource>,
    /// Host credential
    pub credentials: Arc<dyn CredentialProvider>,
    /// Transport used to reach hosts
    pub connector: Arc<dyn Connector>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Controller settings
    pub config: ControllerConfig,
    /// Version written to and compared against the version annotation
    pub version: String,
    /// Trust bundle rotation phase; held for the duration of a convergence pass
    pub(crate) rotation: Mutex<RotationPhase>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(config: ControllerConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// Current trust bundle rotation phase
    pub async fn rotation_phase(&self) -> RotationPhase {
        *self.rotation.lock().await
    }
}

/// Builder for [`Context`]
///
/// With a [`Client`], every collaborator not set explicitly defaults to its
/// Kubernetes-backed implementation. Without one, store, volume stats and
/// credentials must all be provided.
pub struct ContextBuilder {
    config: ControllerConfig,
    client: Option<Client>,
    store: Option<Arc<dyn ClusterStore>>,
    volumes: Option<Arc<dyn VolumeStatsSource>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    connector: Option<Arc<dyn Connector>>,
    events: Option<Arc<dyn EventPublisher>>,
    version: Option<String>,
}

impl ContextBuilder {
    fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            client: None,
            store: None,
            volumes: None,
            credentials: None,
            connector: None,
            events: None,
            version: None,
        }
    }

    /// Kubernetes client backing the default collaborators
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the cluster store
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the volume stats source
    pub fn volume_stats(mut self, volumes: Arc<dyn VolumeStatsSource>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    /// Override the credential provider
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the transport (defaults to SSH)
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the running version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context> {
        let missing = |what: &str| {
            Error::internal_with_context("context", format!("no {what} and no client configured"))
        };
        let client = self.client;
        let config = self.config;

        let store = match (self.store, &client) {
            (Some(store), _) => store,
            (None, Some(client)) => Arc::new(KubeClusterStore::new(client.clone(), &config)),
            (None, None) => return Err(missing("cluster store")),
        };
        let volumes = match (self.volumes, &client) {
            (Some(volumes), _) => volumes,
            (None, Some(client)) => Arc::new(KubeVolumeStats::new(client.clone())),
            (None, None) => return Err(missing("volume stats source")),
        };
        let credentials = match (self.credentials, &client) {
            (Some(credentials), _) => credentials,
            (None, Some(client)) => Arc::new(SecretCredentialProvider::new(client.clone(), &config)),
            (None, None) => return Err(missing("credential provider")),
        };
        let events: Arc<dyn EventPublisher> = match (self.events, &client) {
            (Some(events), _) => events,
            (None, Some(client)) => Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
            (None, None) => Arc::new(NoopEventPublisher),
        };

        Ok(Context {
            store,
            volumes,
            credentials,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(SshConnector::default())),
            events,
            config,
            version: self
                .version
                .unwrap_or_else(|| winnode_common::version().to_string()),
            rotation: Mutex::new(RotationPhase::Stable),
        })
    }
}

/// Reference to a Node for Events
pub fn node_reference(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Wrap a PowerShell script for execution through the host's default shell
pub fn powershell(script: &str) -> String {
    format!("powershell.exe -NonInteractive -ExecutionPolicy Bypass -Command \"{script}\"")
}

/// Every instance listed in the inventory, joined to its Node
///
/// Malformed inventory entries are logged and skipped.
pub async fn managed_instances(ctx: &Context) -> Result<Vec<InstanceRecord>> {
    let data = ctx.store.list_instance_entries().await?;
    let entries = parse_instance_entries(&data)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping malformed instance entry");
                None
            }
        })
        .collect();
    let nodes = ctx.store.list_windows_nodes().await?;
    Ok(build_records(entries, &nodes))
}

/// Reconcile one managed instance
///
/// Idempotent: re-running after any failure converges on the same result.
/// The scheduler must not run two passes for the same instance at once.
#[instrument(skip(record, ctx, cancel), fields(address = %record.address))]
pub async fn reconcile(
    record: InstanceRecord,
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome> {
    let started = Instant::now();
    let node_name = record.node_name().map(str::to_string);

    let result = reconcile_instance(record, ctx, cancel).await;

    let seconds = started.elapsed().as_secs_f64();
    match &result {
        Ok(outcome) => {
            debug!(outcome = outcome.as_str(), "reconcile pass finished");
            record_reconcile(outcome.as_str(), None, seconds);
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "reconcile pass failed");
            record_reconcile("failed", Some(e.kind()), seconds);
            if let Some(name) = node_name {
                ctx.events
                    .publish(
                        &node_reference(&name),
                        EventType::Warning,
                        reasons::RECONCILE_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
        }
    }
    result
}

async fn reconcile_instance(
    mut record: InstanceRecord,
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome> {
    refresh_node(&mut record, ctx).await?;

    let state = lifecycle_state(&record, &ctx.version);
    debug!(?state, "computed lifecycle state");

    let upgrading = match state {
        LifecycleState::UpToDate => return Ok(ReconcileOutcome::AlreadyUpToDate),
        LifecycleState::UpgradeRequired => {
            if check_upgrade_blocked(&record, ctx).await? {
                return Ok(ReconcileOutcome::UpgradeBlocked);
            }
            true
        }
        LifecycleState::NotJoined | LifecycleState::PartiallyConfigured => false,
    };

    let credential = ctx.credentials.credential().await?;
    let target = ConnectTarget::new(&record.address, &record.username, credential)?;
    let mut host = HostChannel::open(ctx, target, cancel).await?;

    let result = configure(&mut host, &record, upgrading, ctx, cancel).await;
    host.close().await;
    result?;

    Ok(ReconcileOutcome::Configured)
}

/// Load the Node snapshot when only its name is known. A Node that no
/// longer exists drops the association.
async fn refresh_node(record: &mut InstanceRecord, ctx: &Context) -> Result<()> {
    let Some(node) = record.node.as_ref() else {
        return Ok(());
    };
    if node.snapshot.is_some() {
        return Ok(());
    }
    let name = node.name.clone();
    record.node = match ctx.store.get_node(&name).await? {
        Some(node) => Some(NodeRef::from_node(node)),
        None => {
            info!(node = %name, "associated node no longer exists");
            None
        }
    };
    Ok(())
}

async fn check_upgrade_blocked(record: &InstanceRecord, ctx: &Context) -> Result<bool> {
    let Some(node) = record.node.as_ref().and_then(|n| n.snapshot.as_ref()) else {
        return Ok(false);
    };
    let name = record.node_name().unwrap_or_default();

    let live = if ctx.config.storage_driver_migration {
        ctx.volumes.live_volumes(name).await?
    } else {
        Vec::new()
    };

    if !upgrade_blocked(node, ctx.config.storage_driver_migration, &live) {
        return Ok(false);
    }

    info!(node = name, "upgrade blocked by attached in-tree volumes");
    ctx.events
        .publish(
            &node_reference(name),
            EventType::Normal,
            reasons::UPGRADE_BLOCKED,
            actions::UPGRADE,
            Some("in-tree volumes are still attached; upgrade deferred".to_string()),
        )
        .await;
    Ok(true)
}

/// The session to one host, re-established after a restart
struct HostChannel<'a> {
    ctx: &'a Context,
    target: ConnectTarget,
    cancel: &'a CancellationToken,
    session: Option<Box<dyn Session>>,
}

impl<'a> HostChannel<'a> {
    async fn open(
        ctx: &'a Context,
        target: ConnectTarget,
        cancel: &'a CancellationToken,
    ) -> Result<HostChannel<'a>> {
        let session = connect(ctx.connector.as_ref(), &target, &ctx.config.connect_poll, cancel).await?;
        Ok(Self {
            ctx,
            target,
            cancel,
            session: Some(session),
        })
    }

    fn session(&mut self) -> Result<&mut dyn Session> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(Error::connectivity(&self.target.address, "session is not open")),
        }
    }

    async fn run(&mut self, command: &str) -> Result<String> {
        self.session()?.run(command).await
    }

    /// Close the current session and connect again with the bounded retry
    async fn reconnect(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        let session = connect(
            self.ctx.connector.as_ref(),
            &self.target,
            &self.ctx.config.connect_poll,
            self.cancel,
        )
        .await?;
        self.session = Some(session);
        Ok(())
    }

    async fn close(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

async fn configure(
    host: &mut HostChannel<'_>,
    record: &InstanceRecord,
    upgrading: bool,
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<()> {
    if upgrading {
        deconfigure(host, record, ctx).await?;
    }

    if let Some(hostname) = record.desired_hostname.as_deref() {
        ensure_hostname(host, hostname).await?;
    }

    transfer_payload(host, ctx).await?;

    let bundle = target_bundle(ctx).await?;
    if let Some(bundle) = &bundle {
        let remote_dir = ctx.config.remote_dir.clone();
        winnode_transport::transfer_bytes(
            host.session()?,
            bundle.to_pem().as_bytes(),
            &ctx.config.bundle_filename,
            &remote_dir,
        )
        .await?;
        debug!(fingerprint = %bundle.fingerprint(), "installed trust bundle");
    }

    let output = host.run(&ctx.config.bootstrap_command).await?;
    debug!(output = %output.trim(), "bootstrap finished");

    let node_name = match record.node_name() {
        Some(name) => name.to_string(),
        None => wait_for_node(&record.address, ctx, cancel).await?,
    };

    let mut annotations = BTreeMap::from([(VERSION_ANNOTATION.to_string(), ctx.version.clone())]);
    if let Some(bundle) = &bundle {
        annotations.insert(TRUST_BUNDLE_HASH_ANNOTATION.to_string(), bundle.fingerprint());
    }
    ctx.store
        .patch_node_annotations(&node_name, &build_add_patch(&annotations)?)
        .await?;

    info!(node = %node_name, version = %ctx.version, "instance configured");
    ctx.events
        .publish(
            &node_reference(&node_name),
            EventType::Normal,
            reasons::INSTANCE_CONFIGURED,
            actions::RECONCILE,
            Some(format!("configured by version {}", ctx.version)),
        )
        .await;
    Ok(())
}

/// Remove the previous version's configuration and the annotations that
/// describe it
async fn deconfigure(host: &mut HostChannel<'_>, record: &InstanceRecord, ctx: &Context) -> Result<()> {
    let output = host.run(&ctx.config.deconfigure_command).await?;
    debug!(output = %output.trim(), "deconfigure finished");

    let Some(node) = record.node.as_ref() else {
        return Ok(());
    };
    let present: BTreeSet<String> = [VERSION_ANNOTATION, TRUST_BUNDLE_HASH_ANNOTATION]
        .into_iter()
        .filter(|key| node.annotation(key).is_some())
        .map(str::to_string)
        .collect();
    if !present.is_empty() {
        ctx.store
            .patch_node_annotations(&node.name, &build_remove_patch(&present)?)
            .await?;
    }

    info!(node = %node.name, "instance deconfigured for upgrade");
    ctx.events
        .publish(
            &node_reference(&node.name),
            EventType::Normal,
            reasons::INSTANCE_DECONFIGURED,
            actions::UPGRADE,
            None,
        )
        .await;
    Ok(())
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 63
        && !hostname.starts_with('-')
        && hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::input_for_field("desired_hostname", format!("invalid hostname {hostname:?}")))
    }
}

/// Rename the host and wait for it to come back when its hostname differs
async fn ensure_hostname(host: &mut HostChannel<'_>, desired: &str) -> Result<()> {
    validate_hostname(desired)?;

    let current = host.run("hostname").await?;
    if current.trim().eq_ignore_ascii_case(desired) {
        return Ok(());
    }

    info!(from = %current.trim(), to = desired, "renaming host");
    let rename = powershell(&format!("Rename-Computer -NewName '{desired}' -Force -Restart"));
    match host.run(&rename).await {
        Ok(_) => {}
        // the restart can take the session down before the exit status arrives
        Err(Error::ChannelClosed { .. }) => debug!("session dropped by rename restart"),
        Err(e) => return Err(e),
    }
    host.reconnect().await
}

/// Copy every file of the payload directory to the remote directory
async fn transfer_payload(host: &mut HostChannel<'_>, ctx: &Context) -> Result<()> {
    let Some(dir) = ctx.config.payload_dir.as_ref() else {
        return Ok(());
    };
    let io_err = |e: std::io::Error| {
        Error::internal_with_context("payload", format!("{}: {e}", dir.display()))
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        if entry.file_type().await.map_err(io_err)?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let remote_dir = ctx.config.remote_dir.clone();
    for path in files {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let mut file = tokio::fs::File::open(&path).await.map_err(io_err)?;
        host.session()?.transfer(&mut file, filename, &remote_dir).await?;
        debug!(file = filename, "transferred payload file");
    }
    Ok(())
}

/// Wait for the Node created by a freshly configured host to register
async fn wait_for_node(address: &str, ctx: &Context, cancel: &CancellationToken) -> Result<String> {
    let description = format!("node registration for {address}");
    let poll = &ctx.config.node_registration_poll;

    let outcome = poll_bounded(
        poll,
        cancel,
        &description,
        |e| !e.is_retryable(),
        move || async move {
            Ok(ctx
                .store
                .find_node_by_address(address)
                .await?
                .and_then(|node| node.metadata.name))
        },
    )
    .await;

    match outcome {
        Ok(name) => Ok(name),
        Err(PollError::Aborted(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::cancelled(description)),
        Err(PollError::TimedOut { last_error, .. }) => Err(Error::internal_with_context(
            description,
            match last_error {
                Some(e) => format!("no node registered within {:?}: {e}", poll.timeout),
                None => format!("no node registered within {:?}", poll.timeout),
            },
        )),
    }
}
