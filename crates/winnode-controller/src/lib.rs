//! Lifecycle reconciliation for externally provisioned Windows hosts
//!
//! [`reconcile`] brings one managed instance to the running version.
//! [`check_certificate_convergence`] drives every up-to-date host onto the
//! current trust bundle. Both run against the collaborator traits in
//! [`controller`], with Kubernetes-backed implementations in [`kube_store`].

#![deny(missing_docs)]

pub mod annotations;
pub mod certificates;
pub mod config;
pub mod controller;
pub mod convergence;
pub mod instances;
pub mod kube_store;
pub mod upgrade_gate;

pub use annotations::{build_add_patch, build_remove_patch, PatchDocument, PatchOp, PatchOperation};
pub use certificates::CertificateBundle;
pub use config::ControllerConfig;
pub use controller::{
    managed_instances, reconcile, ClusterStore, Context, ContextBuilder, CredentialProvider,
    ReconcileOutcome, VolumeStatsSource,
};
pub use convergence::{
    check_certificate_convergence, ConvergenceReport, HostConvergence, HostStatus, RotationPhase,
};
pub use instances::{
    build_records, is_up_to_date, lifecycle_state, needs_upgrade, node_has_address,
    parse_instance_entries, usable_addresses, InstanceEntry, InstanceRecord, LifecycleState,
    NodeRef,
};
pub use upgrade_gate::{upgrade_blocked, LiveVolume};
