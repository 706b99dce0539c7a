//! Trust bundle convergence across managed hosts
//!
//! Each pass compares the authoritative bundle with the bundle every host last
//! converged on. When they differ a rotation is in progress: the merged
//! bundle (union of the authoritative, converged and pending bundles, minus
//! expired prior certificates) is recorded as pending, pushed to every
//! up-to-date host and re-read until it is present. Once every host holds it,
//! the merged bundle becomes the converged bundle and pending is cleared.
//!
//! The pending bundle covers passes that reach only some hosts: certificates
//! already installed on those hosts stay in every later target.
//!
//! Phases: `Stable -> RotationDetected -> Propagating -> Stable`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use kube::runtime::events::EventType;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use winnode_common::events::{actions, reasons};
use winnode_common::metrics::record_bundle_convergence;
use winnode_common::{poll_bounded, Error, PollError, Result, TRUST_BUNDLE_HASH_ANNOTATION};
use winnode_transport::{connect, transfer_bytes, ConnectTarget, Session};

use crate::annotations::build_add_patch;
use crate::certificates::CertificateBundle;
use crate::controller::{managed_instances, node_reference, powershell, Context};
use crate::instances::{is_up_to_date, InstanceRecord};

/// Trust bundle rotation phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationPhase {
    /// Every host holds the converged bundle
    Stable,
    /// The authoritative bundle changed; propagation has not started
    RotationDetected,
    /// The merged bundle is being installed on hosts
    Propagating,
}

/// Per-host result of a convergence pass
#[derive(Debug)]
pub enum HostStatus {
    /// The Node's fingerprint annotation already matched; host not contacted
    AlreadyConverged,
    /// The host already held the bundle; only the annotation was written
    Verified,
    /// The bundle was installed and verified
    Installed,
    /// The host did not converge
    Failed(Error),
}

impl HostStatus {
    /// Whether the host holds the target bundle
    pub fn is_converged(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::AlreadyConverged | Self::Verified => "converged",
            Self::Installed => "installed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Convergence of one host
#[derive(Debug)]
pub struct HostConvergence {
    /// Host address
    pub address: String,
    /// Node name
    pub node: String,
    /// Outcome
    pub status: HostStatus,
}

/// Result of one convergence pass
#[derive(Debug)]
pub struct ConvergenceReport {
    /// Phase after the pass
    pub phase: RotationPhase,
    /// Fingerprint of the bundle hosts must hold
    pub target_fingerprint: String,
    /// Per-host outcomes
    pub hosts: Vec<HostConvergence>,
}

impl ConvergenceReport {
    /// Whether every managed host holds the target bundle
    pub fn is_converged(&self) -> bool {
        self.hosts.iter().all(|h| h.status.is_converged())
    }

    /// Hosts that did not converge
    pub fn failures(&self) -> impl Iterator<Item = &HostConvergence> {
        self.hosts.iter().filter(|h| !h.status.is_converged())
    }
}

/// Whether moving from `converged` to `target` is a rotation that must be
/// propagated to hosts. Certificate order does not matter.
pub fn rotation_pending(converged: Option<&CertificateBundle>, target: &CertificateBundle) -> bool {
    !converged.is_some_and(|c| c.same_certificates(target))
}

/// Bundles a new target is computed from
struct TargetPlan {
    /// Last bundle every managed host converged on
    converged: Option<CertificateBundle>,
    /// Bundle of a rotation still propagating; some hosts may already hold it
    pending: Option<CertificateBundle>,
    /// Union of the authoritative bundle and both stored bundles
    target: CertificateBundle,
}

impl TargetPlan {
    fn rotating(&self) -> bool {
        rotation_pending(self.converged.as_ref(), &self.target)
    }

    /// Whether the pending bundle must be (re)written before hosts receive
    /// the target
    fn pending_is_stale(&self) -> bool {
        self.rotating()
            && !self
                .pending
                .as_ref()
                .is_some_and(|p| p.same_certificates(&self.target))
    }
}

fn parse_stored(text: Option<String>, which: &str) -> Option<CertificateBundle> {
    match CertificateBundle::parse(&text?) {
        Ok(bundle) if !bundle.is_empty() => Some(bundle),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, bundle = which, "stored trust bundle is unreadable, ignoring it");
            None
        }
    }
}

async fn plan_target(ctx: &Context) -> Result<Option<TargetPlan>> {
    let Some(authoritative) = load_authoritative(ctx).await? else {
        return Ok(None);
    };
    let converged = parse_stored(ctx.store.get_converged_bundle().await?, "converged");
    let pending = parse_stored(ctx.store.get_pending_bundle().await?, "pending");

    let prior = match (&converged, &pending) {
        (Some(converged), Some(pending)) => Some(converged.union(pending)),
        (converged, pending) => converged.clone().or_else(|| pending.clone()),
    };
    let target = CertificateBundle::merge(prior.as_ref(), &authoritative);
    Ok(Some(TargetPlan {
        converged,
        pending,
        target,
    }))
}

/// Persist the target as the pending bundle before any host receives it, so
/// that a later target is merged onto everything hosts may already hold
async fn record_pending(ctx: &Context, plan: &TargetPlan) -> Result<()> {
    if plan.pending_is_stale() {
        debug!(fingerprint = %plan.target.fingerprint(), "recording pending trust bundle");
        ctx.store.put_pending_bundle(&plan.target.to_pem()).await?;
    }
    Ok(())
}

/// Bundle hosts must hold right now, or `None` when no authoritative bundle
/// is published. A bundle that starts a rotation is recorded as pending.
pub async fn target_bundle(ctx: &Context) -> Result<Option<CertificateBundle>> {
    let Some(plan) = plan_target(ctx).await? else {
        return Ok(None);
    };
    record_pending(ctx, &plan).await?;
    Ok(Some(plan.target))
}

async fn load_authoritative(ctx: &Context) -> Result<Option<CertificateBundle>> {
    let Some(text) = ctx.store.get_trust_bundle().await? else {
        return Ok(None);
    };
    let authoritative = CertificateBundle::parse(&text)?;
    if authoritative.is_empty() {
        return Err(Error::input("authoritative trust bundle holds no certificates"));
    }
    Ok(Some(authoritative))
}

async fn managed_up_to_date(ctx: &Context) -> Result<Vec<InstanceRecord>> {
    Ok(managed_instances(ctx)
        .await?
        .into_iter()
        .filter(|r| is_up_to_date(r, &ctx.version))
        .collect())
}

/// Run one convergence pass over every up-to-date managed host.
///
/// Hosts converge independently: one host timing out does not stop the
/// others. Only a pass in which every host converged moves the phase back to
/// `Stable` and persists the merged bundle.
#[instrument(skip(ctx, cancel))]
pub async fn check_certificate_convergence(
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<ConvergenceReport> {
    let mut phase = ctx.rotation.lock().await;

    let Some(plan) = plan_target(ctx).await? else {
        return Err(Error::input("no authoritative trust bundle is published"));
    };
    let target = &plan.target;
    let fingerprint = target.fingerprint();

    let rotating = plan.rotating();
    if rotating && *phase == RotationPhase::Stable {
        info!(fingerprint = %fingerprint, certificates = target.len(), "trust bundle rotation detected");
        *phase = RotationPhase::RotationDetected;
    }

    let hosts = managed_up_to_date(ctx).await?;
    if rotating {
        record_pending(ctx, &plan).await?;
        *phase = RotationPhase::Propagating;
    }

    let target_pem = target.to_pem();
    let hosts = join_all(
        hosts
            .iter()
            .map(|record| converge_host(ctx, record, target, &target_pem, &fingerprint, cancel)),
    )
    .await;

    let report_phase = if hosts.iter().all(|h| h.status.is_converged()) {
        if rotating {
            ctx.store.put_converged_bundle(&target_pem).await?;
            info!(fingerprint = %fingerprint, hosts = hosts.len(), "trust bundle converged");
        }
        if rotating || plan.pending.is_some() {
            ctx.store.clear_pending_bundle().await?;
        }
        RotationPhase::Stable
    } else {
        *phase
    };
    *phase = report_phase;

    Ok(ConvergenceReport {
        phase: report_phase,
        target_fingerprint: fingerprint,
        hosts,
    })
}

async fn converge_host(
    ctx: &Context,
    record: &InstanceRecord,
    target: &CertificateBundle,
    target_pem: &str,
    fingerprint: &str,
    cancel: &CancellationToken,
) -> HostConvergence {
    let node = record.node_name().unwrap_or_default().to_string();

    let already = record
        .node
        .as_ref()
        .and_then(|n| n.annotation(TRUST_BUNDLE_HASH_ANNOTATION))
        == Some(fingerprint);

    let status = if already {
        HostStatus::AlreadyConverged
    } else {
        match install_and_verify(ctx, record, target, target_pem, fingerprint, cancel).await {
            Ok(true) => HostStatus::Installed,
            Ok(false) => HostStatus::Verified,
            Err(e) => HostStatus::Failed(e),
        }
    };

    record_bundle_convergence(status.metric_label());
    match &status {
        HostStatus::Installed => {
            ctx.events
                .publish(
                    &node_reference(&node),
                    EventType::Normal,
                    reasons::TRUST_BUNDLE_INSTALLED,
                    actions::CONVERGE,
                    Some(format!("installed trust bundle {fingerprint}")),
                )
                .await;
        }
        HostStatus::Failed(e) => {
            warn!(address = %record.address, error = %e, "host did not converge on trust bundle");
            ctx.events
                .publish(
                    &node_reference(&node),
                    EventType::Warning,
                    reasons::TRUST_BUNDLE_NOT_CONVERGED,
                    actions::CONVERGE,
                    Some(e.to_string()),
                )
                .await;
        }
        HostStatus::AlreadyConverged | HostStatus::Verified => {}
    }

    HostConvergence {
        address: record.address.clone(),
        node,
        status,
    }
}

/// Returns whether the bundle had to be (re)installed
async fn install_and_verify(
    ctx: &Context,
    record: &InstanceRecord,
    target: &CertificateBundle,
    target_pem: &str,
    fingerprint: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let credential = ctx.credentials.credential().await?;
    let connect_target = ConnectTarget::new(&record.address, &record.username, credential)?;
    let session =
        connect(ctx.connector.as_ref(), &connect_target, &ctx.config.connect_poll, cancel).await?;

    let session = Mutex::new(session);
    let result = poll_for_bundle(ctx, &record.address, &session, target, target_pem, cancel).await;
    session.into_inner().close().await;
    let installed = result?;

    if let Some(node) = record.node_name() {
        let annotations =
            BTreeMap::from([(TRUST_BUNDLE_HASH_ANNOTATION.to_string(), fingerprint.to_string())]);
        ctx.store
            .patch_node_annotations(node, &build_add_patch(&annotations)?)
            .await?;
    }
    Ok(installed)
}

async fn poll_for_bundle(
    ctx: &Context,
    address: &str,
    session: &Mutex<Box<dyn Session>>,
    target: &CertificateBundle,
    target_pem: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let config = &ctx.config;
    let path = config.bundle_path();
    let read = powershell(&format!(
        "if (Test-Path -Path '{path}') {{ Get-Content -Raw -Path '{path}' }}"
    ));
    let description = format!("trust bundle on {address}");
    let installed = AtomicBool::new(false);
    let installed_ref = &installed;
    let read = read.as_str();

    let outcome = poll_bounded(
        &config.convergence_poll,
        cancel,
        &description,
        |e| !e.is_retryable(),
        move || async move {
            let mut session = session.lock().await;
            let current = session.run(read).await?;
            if target.is_installed_in(&current) {
                return Ok(Some(()));
            }
            debug!(address, "trust bundle absent, installing");
            transfer_bytes(
                &mut **session,
                target_pem.as_bytes(),
                &config.bundle_filename,
                &config.remote_dir,
            )
            .await?;
            installed_ref.store(true, Ordering::SeqCst);
            Ok(None)
        },
    )
    .await;

    match outcome {
        Ok(()) => Ok(installed.load(Ordering::SeqCst)),
        Err(PollError::Aborted(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::cancelled(description)),
        Err(PollError::TimedOut { last_error, .. }) => Err(Error::convergence_timeout(
            address,
            config.convergence_poll.timeout,
            match last_error {
                Some(e) => e.to_string(),
                None => "bundle still absent after installation".to_string(),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::{MockClusterStore, MockCredentialProvider, MockVolumeStatsSource};
    use crate::instances::NodeRef;
    use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;
    use rcgen::{CertificateParams, KeyPair};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use winnode_common::{PollConfig, VERSION_ANNOTATION};
    use winnode_transport::testing::{FakeHost, ScriptedConnector};
    use winnode_transport::Credential;

    const VERSION: &str = "0.4.0";
    const BUNDLE_PATH: &str = "C:\\k\\kubelet-ca.crt";

    fn cert(name: &str) -> String {
        let params = CertificateParams::new(vec![name.to_string()]).expect("params");
        let key = KeyPair::generate().expect("key");
        params.self_signed(&key).expect("self signed").pem()
    }

    fn node(name: &str, address: &str, hash: Option<&str>) -> Node {
        let mut annotations =
            BTreeMap::from([(VERSION_ANNOTATION.to_string(), VERSION.to_string())]);
        if let Some(hash) = hash {
            annotations.insert(TRUST_BUNDLE_HASH_ANNOTATION.to_string(), hash.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: address.to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Host responder that serves the bundle file like `Get-Content -Raw`
    fn bundle_host() -> FakeHost {
        FakeHost::new().with_responder(|cmd, files| {
            if cmd.contains("Get-Content") {
                Ok(files.get(BUNDLE_PATH).cloned().unwrap_or_default())
            } else {
                Ok(String::new())
            }
        })
    }

    #[derive(Default)]
    struct Cluster {
        authoritative: Arc<StdMutex<String>>,
        converged: Arc<StdMutex<Option<String>>>,
        pending: Arc<StdMutex<Option<String>>>,
        nodes: Vec<Node>,
        patches: Arc<StdMutex<Vec<String>>>,
    }

    fn shared<T>(value: T) -> Arc<StdMutex<T>> {
        Arc::new(StdMutex::new(value))
    }

    impl Cluster {
        fn store(&self) -> MockClusterStore {
            let mut store = MockClusterStore::new();
            let authoritative = self.authoritative.clone();
            store
                .expect_get_trust_bundle()
                .returning(move || Ok(Some(authoritative.lock().expect("lock").clone())));
            let converged = self.converged.clone();
            store
                .expect_get_converged_bundle()
                .returning(move || Ok(converged.lock().expect("lock").clone()));
            let converged = self.converged.clone();
            store.expect_put_converged_bundle().returning(move |pem| {
                *converged.lock().expect("lock") = Some(pem.to_string());
                Ok(())
            });
            let pending = self.pending.clone();
            store
                .expect_get_pending_bundle()
                .returning(move || Ok(pending.lock().expect("lock").clone()));
            let pending = self.pending.clone();
            store.expect_put_pending_bundle().returning(move |pem| {
                *pending.lock().expect("lock") = Some(pem.to_string());
                Ok(())
            });
            let pending = self.pending.clone();
            store.expect_clear_pending_bundle().returning(move || {
                *pending.lock().expect("lock") = None;
                Ok(())
            });
            let addresses: BTreeMap<String, String> = self
                .nodes
                .iter()
                .filter_map(|n| n.status.as_ref()?.addresses.as_ref()?.first().cloned())
                .map(|a| (a.address, "username=Administrator".to_string()))
                .collect();
            store
                .expect_list_instance_entries()
                .returning(move || Ok(addresses.clone()));
            let nodes = self.nodes.clone();
            store
                .expect_list_windows_nodes()
                .returning(move || Ok(nodes.clone()));
            let patches = self.patches.clone();
            store.expect_patch_node_annotations().returning(move |name, _| {
                patches.lock().expect("lock").push(name.to_string());
                Ok(())
            });
            store
        }
    }

    fn context(store: MockClusterStore, connector: ScriptedConnector) -> Context {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_credential()
            .returning(|| Ok(Credential::from_private_key_pem("key")));
        let poll = PollConfig::new(Duration::from_secs(10), Duration::from_secs(60));
        Context::builder(ControllerConfig {
            connect_poll: poll,
            convergence_poll: poll,
            ..Default::default()
        })
        .store(Arc::new(store))
        .volume_stats(Arc::new(MockVolumeStatsSource::new()))
        .credentials(Arc::new(credentials))
        .connector(Arc::new(connector))
        .version(VERSION)
        .build()
        .expect("context")
    }

    /// Story: the cluster CA gains a new certificate
    ///
    /// The host last converged on {A}. The authoritative bundle is now {A, B}.
    /// After one pass the host holds {A, B}, never {B} alone, its Node is
    /// annotated with the new fingerprint, and the merged bundle is persisted.
    #[tokio::test(start_paused = true)]
    async fn story_host_converges_on_union_bundle() {
        let (a, b) = (cert("a"), cert("b"));
        let prior = CertificateBundle::parse(&a).expect("prior");
        let host = bundle_host().with_file(BUNDLE_PATH, prior.to_pem());
        let cluster = Cluster {
            authoritative: shared(format!("{a}{b}")),
            converged: shared(Some(prior.to_pem())),
            nodes: vec![node("win-1", "10.0.0.5", Some(&prior.fingerprint()))],
            ..Default::default()
        };
        let ctx = context(
            cluster.store(),
            ScriptedConnector::new().with_host("10.0.0.5", host.clone()),
        );

        let report = check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect("pass");

        assert!(report.is_converged());
        assert_eq!(report.phase, RotationPhase::Stable);
        assert!(matches!(report.hosts[0].status, HostStatus::Installed));

        let installed = CertificateBundle::parse(&host.file(BUNDLE_PATH).expect("file")).expect("pem");
        let expected = CertificateBundle::parse(&format!("{a}{b}")).expect("expected");
        assert!(installed.is_superset_of(&expected));
        assert_eq!(installed.len(), 2);
        assert_eq!(report.target_fingerprint, expected.fingerprint());

        assert_eq!(*cluster.patches.lock().expect("lock"), vec!["win-1".to_string()]);
        assert_eq!(
            cluster.converged.lock().expect("lock").as_deref(),
            Some(installed.to_pem().as_str())
        );
        assert_eq!(host.closed_sessions(), 1);
    }

    /// Story: the outgoing CA is kept during rotation
    ///
    /// Authoritative moves from {A} to {B}. Hosts receive {B, A} so that
    /// anything still signed by A keeps validating.
    #[tokio::test(start_paused = true)]
    async fn story_rotation_never_removes_prior_certificate() {
        let (a, b) = (cert("a"), cert("b"));
        let prior = CertificateBundle::parse(&a).expect("prior");
        let host = bundle_host().with_file(BUNDLE_PATH, prior.to_pem());
        let cluster = Cluster {
            authoritative: shared(b.clone()),
            converged: shared(Some(prior.to_pem())),
            nodes: vec![node("win-1", "10.0.0.5", Some(&prior.fingerprint()))],
            ..Default::default()
        };
        let ctx = context(
            cluster.store(),
            ScriptedConnector::new().with_host("10.0.0.5", host.clone()),
        );

        check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect("pass");

        let installed = CertificateBundle::parse(&host.file(BUNDLE_PATH).expect("file")).expect("pem");
        assert!(installed.is_superset_of(&prior));
        assert!(installed.is_superset_of(&CertificateBundle::parse(&b).expect("b")));
    }

    /// Story: one host is unreachable mid-rotation
    ///
    /// The reachable host converges. The other reports a failure, the phase
    /// stays Propagating and the converged bundle is not replaced.
    #[tokio::test(start_paused = true)]
    async fn story_failed_host_does_not_block_others() {
        let (a, b) = (cert("a"), cert("b"));
        let prior = CertificateBundle::parse(&a).expect("prior");
        let good = bundle_host().with_file(BUNDLE_PATH, prior.to_pem());
        let broken = bundle_host().with_file(BUNDLE_PATH, prior.to_pem());
        broken.set_fail_transfers(true);
        let cluster = Cluster {
            authoritative: shared(format!("{a}{b}")),
            converged: shared(Some(prior.to_pem())),
            nodes: vec![
                node("win-1", "10.0.0.5", None),
                node("win-2", "10.0.0.6", None),
            ],
            ..Default::default()
        };
        let ctx = context(
            cluster.store(),
            ScriptedConnector::new()
                .with_host("10.0.0.5", good.clone())
                .with_host("10.0.0.6", broken.clone()),
        );

        let report = check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect("pass");

        assert!(!report.is_converged());
        assert_eq!(report.phase, RotationPhase::Propagating);
        assert_eq!(ctx.rotation_phase().await, RotationPhase::Propagating);

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].address, "10.0.0.6");
        assert!(matches!(
            failures[0].status,
            HostStatus::Failed(Error::ConvergenceTimeout { .. })
        ));
        let on_good = CertificateBundle::parse(&good.file(BUNDLE_PATH).expect("file")).expect("pem");
        assert!(on_good.is_superset_of(&CertificateBundle::parse(&b).expect("b")));
        assert_eq!(
            cluster.converged.lock().expect("lock").as_deref(),
            Some(prior.to_pem().as_str())
        );
        assert_eq!(broken.closed_sessions(), 1);
    }

    /// Story: the CA rotates again before a broken host recovers
    ///
    /// Pass 1 pushes {A}; win-1 takes it, win-2 rejects every transfer. The
    /// authoritative bundle then moves to {B}. Pass 2 must keep A on win-1
    /// because nothing ever converged on {A} alone. Once win-2 recovers the
    /// cluster converges on {B, A} and the pending bundle is cleared.
    #[tokio::test(start_paused = true)]
    async fn story_partial_rotation_keeps_installed_certificates() {
        let (a, b) = (cert("a"), cert("b"));
        let bundle_a = CertificateBundle::parse(&a).expect("a");
        let bundle_b = CertificateBundle::parse(&b).expect("b");
        let good = bundle_host();
        let broken = bundle_host();
        broken.set_fail_transfers(true);
        let cluster = Cluster {
            authoritative: shared(a.clone()),
            nodes: vec![
                node("win-1", "10.0.0.5", None),
                node("win-2", "10.0.0.6", None),
            ],
            ..Default::default()
        };
        let ctx = context(
            cluster.store(),
            ScriptedConnector::new()
                .with_host("10.0.0.5", good.clone())
                .with_host("10.0.0.6", broken.clone()),
        );
        let cancel = CancellationToken::new();

        let report = check_certificate_convergence(&ctx, &cancel).await.expect("pass 1");
        assert_eq!(report.phase, RotationPhase::Propagating);
        let on_good = CertificateBundle::parse(&good.file(BUNDLE_PATH).expect("file")).expect("pem");
        assert!(on_good.same_certificates(&bundle_a));
        assert!(cluster.converged.lock().expect("lock").is_none());
        assert!(cluster.pending.lock().expect("lock").is_some());

        *cluster.authoritative.lock().expect("lock") = b.clone();
        let report = check_certificate_convergence(&ctx, &cancel).await.expect("pass 2");
        assert_eq!(report.phase, RotationPhase::Propagating);
        let on_good = CertificateBundle::parse(&good.file(BUNDLE_PATH).expect("file")).expect("pem");
        assert!(on_good.is_superset_of(&bundle_a));
        assert!(on_good.is_superset_of(&bundle_b));

        broken.set_fail_transfers(false);
        let report = check_certificate_convergence(&ctx, &cancel).await.expect("pass 3");
        assert!(report.is_converged());
        assert_eq!(report.phase, RotationPhase::Stable);
        let on_broken =
            CertificateBundle::parse(&broken.file(BUNDLE_PATH).expect("file")).expect("pem");
        assert!(on_broken.is_superset_of(&bundle_a));
        assert!(on_broken.is_superset_of(&bundle_b));
        let converged = cluster.converged.lock().expect("lock").clone().expect("converged");
        assert!(CertificateBundle::parse(&converged)
            .expect("pem")
            .same_certificates(&on_broken));
        assert!(cluster.pending.lock().expect("lock").is_none());
    }

    #[tokio::test]
    async fn test_reordered_authoritative_bundle_is_not_a_rotation() {
        let (a, b) = (cert("a"), cert("b"));
        let converged = CertificateBundle::parse(&format!("{a}{b}")).expect("ab");
        let cluster = Cluster {
            authoritative: shared(format!("{b}{a}")),
            converged: shared(Some(converged.to_pem())),
            nodes: vec![node("win-1", "10.0.0.5", Some(&converged.fingerprint()))],
            ..Default::default()
        };
        let ctx = context(cluster.store(), ScriptedConnector::new());

        let report = check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect("pass");

        assert_eq!(report.phase, RotationPhase::Stable);
        assert!(matches!(report.hosts[0].status, HostStatus::AlreadyConverged));
        assert!(cluster.pending.lock().expect("lock").is_none());
        assert!(cluster.patches.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_matching_fingerprint_skips_host() {
        let a = cert("a");
        let bundle = CertificateBundle::parse(&a).expect("bundle");
        let cluster = Cluster {
            authoritative: shared(a.clone()),
            converged: shared(Some(bundle.to_pem())),
            nodes: vec![node("win-1", "10.0.0.5", Some(&bundle.fingerprint()))],
            ..Default::default()
        };
        let connector = ScriptedConnector::new();
        let ctx = context(cluster.store(), connector);

        let report = check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect("pass");

        assert!(matches!(report.hosts[0].status, HostStatus::AlreadyConverged));
        assert_eq!(report.phase, RotationPhase::Stable);
        assert!(cluster.patches.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_host_already_holding_bundle_is_only_annotated() {
        let a = cert("a");
        let bundle = CertificateBundle::parse(&a).expect("bundle");
        let host = bundle_host().with_file(BUNDLE_PATH, bundle.to_pem().replace('\n', "\r\n"));
        let cluster = Cluster {
            authoritative: shared(a.clone()),
            converged: shared(None),
            nodes: vec![node("win-1", "10.0.0.5", None)],
            ..Default::default()
        };
        let ctx = context(
            cluster.store(),
            ScriptedConnector::new().with_host("10.0.0.5", host.clone()),
        );

        let report = check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect("pass");

        assert!(matches!(report.hosts[0].status, HostStatus::Verified));
        assert_eq!(host.commands().len(), 1);
        assert_eq!(cluster.patches.lock().expect("lock").len(), 1);
        assert!(cluster.converged.lock().expect("lock").is_some());
    }

    #[tokio::test]
    async fn test_missing_authoritative_bundle_is_input_error() {
        let mut store = MockClusterStore::new();
        store.expect_get_trust_bundle().returning(|| Ok(None));
        let ctx = context(store, ScriptedConnector::new());

        let err = check_certificate_convergence(&ctx, &CancellationToken::new())
            .await
            .expect_err("no bundle");
        assert!(matches!(err, Error::Input { .. }));
    }

    #[test]
    fn test_rotation_pending() {
        let (a, b) = (cert("a"), cert("b"));
        let prior = CertificateBundle::parse(&a).expect("a");
        let target = CertificateBundle::parse(&format!("{a}{b}")).expect("ab");
        assert!(rotation_pending(None, &prior));
        assert!(rotation_pending(Some(&prior), &target));
        assert!(!rotation_pending(Some(&target), &target));
        let reordered = CertificateBundle::parse(&format!("{b}{a}")).expect("ba");
        assert!(!rotation_pending(Some(&target), &reordered));
    }

    #[test]
    fn test_not_up_to_date_records_are_excluded() {
        let record = InstanceRecord::new("10.0.0.5", "Administrator")
            .with_node(NodeRef::from_node(node("win-1", "10.0.0.5", None)));
        assert!(is_up_to_date(&record, VERSION));
        assert!(!is_up_to_date(&record, "0.5.0"));
    }
}
