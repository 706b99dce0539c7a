//! Kubernetes Events for managed Windows nodes.
//!
//! Events are fire-and-forget: a failed publish is logged as a warning and
//! never breaks reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about cluster objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops everything, for tests and dry runs
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons shown in `kubectl get events`
pub mod reasons {
    /// Instance configured and annotated with the running version
    pub const INSTANCE_CONFIGURED: &str = "InstanceConfigured";
    /// Upgrade deferred while in-tree volumes are attached
    pub const UPGRADE_BLOCKED: &str = "UpgradeBlocked";
    /// Previous configuration removed ahead of an upgrade
    pub const INSTANCE_DECONFIGURED: &str = "InstanceDeconfigured";
    /// Reconcile pass failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Trust bundle installed on the host
    pub const TRUST_BUNDLE_INSTALLED: &str = "TrustBundleInstalled";
    /// Trust bundle did not converge in time
    pub const TRUST_BUNDLE_NOT_CONVERGED: &str = "TrustBundleNotConverged";
}

/// Event actions
pub mod actions {
    /// Instance reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Upgrade gate evaluation
    pub const UPGRADE: &str = "Upgrade";
    /// Trust bundle convergence
    pub const CONVERGE: &str = "Converge";
}
