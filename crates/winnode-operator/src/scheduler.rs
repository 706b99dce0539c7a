//! Background tasks driving the controller
//!
//! - the reconcile loop runs one pass over the inventory per interval; a pass
//!   finishes before the next starts, so no instance is reconciled twice at once
//! - the convergence loop checks the trust bundle on every managed host per
//!   interval, and immediately when the bundle watcher reports a change
//! - the bundle watcher follows the authoritative trust bundle ConfigMap

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use winnode_common::Error;
use winnode_controller::{
    check_certificate_convergence, managed_instances, reconcile, Context, ControllerConfig,
    ReconcileOutcome,
};

/// Watcher timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run reconcile passes until cancelled
pub async fn run_reconcile_loop(ctx: Arc<Context>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(ctx.config.reconcile_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => reconcile_all(&ctx, &cancel).await,
        }
    }
    info!("reconcile loop stopped");
}

async fn reconcile_all(ctx: &Context, cancel: &CancellationToken) {
    let records = match managed_instances(ctx).await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "failed to load managed instances");
            return;
        }
    };
    if records.is_empty() {
        debug!("no managed instances");
        return;
    }

    let results = join_all(records.into_iter().map(|record| reconcile(record, ctx, cancel))).await;

    let (mut configured, mut blocked, mut failed) = (0, 0, 0);
    for result in &results {
        match result {
            Ok(ReconcileOutcome::Configured) => configured += 1,
            Ok(ReconcileOutcome::UpgradeBlocked) => blocked += 1,
            Ok(ReconcileOutcome::AlreadyUpToDate) => {}
            Err(_) => failed += 1,
        }
    }
    info!(
        instances = results.len(),
        configured, blocked, failed, "reconcile pass complete"
    );
}

/// Run convergence passes until cancelled
pub async fn run_convergence_loop(
    ctx: Arc<Context>,
    bundle_changed: Arc<Notify>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = bundle_changed.notified() => info!("trust bundle changed"),
        }

        match check_certificate_convergence(&ctx, &cancel).await {
            Ok(report) if report.is_converged() => {
                debug!(
                    fingerprint = %report.target_fingerprint,
                    hosts = report.hosts.len(),
                    "trust bundle converged"
                );
            }
            Ok(report) => {
                let failed: Vec<&str> = report.failures().map(|h| h.address.as_str()).collect();
                warn!(
                    fingerprint = %report.target_fingerprint,
                    phase = ?report.phase,
                    ?failed,
                    "trust bundle not converged"
                );
            }
            Err(Error::Cancelled { .. }) => break,
            Err(e @ Error::Input { .. }) => debug!(error = %e, "skipping convergence pass"),
            Err(e) => error!(error = %e, "convergence pass failed"),
        }
    }
    info!("convergence loop stopped");
}

/// Watch the authoritative trust bundle and signal content changes
pub async fn watch_trust_bundle(
    client: Client,
    config: ControllerConfig,
    bundle_changed: Arc<Notify>,
    cancel: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &config.trust_bundle_namespace);
    let watch_config = watcher::Config::default()
        .fields(&format!("metadata.name={}", config.trust_bundle_configmap))
        .timeout(WATCH_TIMEOUT_SECS);
    let mut stream = watcher(api, watch_config)
        .default_backoff()
        .applied_objects()
        .boxed();

    let mut last_seen: Option<String> = None;
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(configmap)) => {
                let bundle = configmap
                    .data
                    .and_then(|mut data| data.remove(&config.trust_bundle_key));
                if bundle_changed_since(&mut last_seen, bundle) {
                    bundle_changed.notify_one();
                }
            }
            Some(Err(e)) => warn!(error = %e, "trust bundle watch error"),
            None => break,
        }
    }
    info!("trust bundle watcher stopped");
}

/// Record `current` and report whether it differs from what was last seen.
/// The first observation counts as a change.
fn bundle_changed_since(last_seen: &mut Option<String>, current: Option<String>) -> bool {
    let Some(current) = current else {
        return false;
    };
    if last_seen.as_deref() == Some(current.as_str()) {
        return false;
    }
    *last_seen = Some(current);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_change_detection() {
        let mut last = None;

        assert!(bundle_changed_since(&mut last, Some("a".to_string())));
        assert!(!bundle_changed_since(&mut last, Some("a".to_string())));
        assert!(!bundle_changed_since(&mut last, None));
        assert!(bundle_changed_since(&mut last, Some("a\nb".to_string())));
        assert_eq!(last.as_deref(), Some("a\nb"));
    }
}
