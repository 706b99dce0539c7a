//! Controller settings
//!
//! Built by the operator binary from its CLI/env configuration. Nothing here
//! reads the environment itself.

use std::path::PathBuf;
use std::time::Duration;

use winnode_common::{PollConfig, DEFAULT_OPERATOR_NAMESPACE};

/// Default remote directory holding Kubernetes files on Windows hosts
pub const DEFAULT_REMOTE_DIR: &str = "C:\\k";

/// Default trust bundle filename on hosts
pub const DEFAULT_BUNDLE_FILENAME: &str = "kubelet-ca.crt";

/// Default interval between full reconcile passes
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Settings consumed by reconcile and convergence
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace holding the operator's own objects
    pub namespace: String,
    /// ConfigMap listing managed instances (`address -> username=<user>`)
    pub instance_configmap: String,
    /// Secret holding the SSH private key
    pub private_key_secret: String,
    /// Key within the private key Secret
    pub private_key_secret_key: String,
    /// Namespace of the authoritative trust bundle ConfigMap
    pub trust_bundle_namespace: String,
    /// ConfigMap holding the authoritative trust bundle
    pub trust_bundle_configmap: String,
    /// Key within the trust bundle ConfigMap
    pub trust_bundle_key: String,
    /// ConfigMap (in `namespace`) storing the last converged bundle
    pub converged_bundle_configmap: String,
    /// Remote directory for Kubernetes files on the host
    pub remote_dir: String,
    /// Trust bundle filename within `remote_dir`
    pub bundle_filename: String,
    /// Local directory whose files are copied to `remote_dir` during configuration
    pub payload_dir: Option<PathBuf>,
    /// Command that configures the host to join the cluster
    pub bootstrap_command: String,
    /// Command that removes a previous configuration
    pub deconfigure_command: String,
    /// Whether this version switches the storage driver from in-tree to CSI
    pub storage_driver_migration: bool,
    /// Connection retry bounds
    pub connect_poll: PollConfig,
    /// Per-host trust bundle convergence bounds
    pub convergence_poll: PollConfig,
    /// Bounds on waiting for a Node to register after configuration
    pub node_registration_poll: PollConfig,
    /// Time between full reconcile passes
    pub reconcile_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            instance_configmap: "windows-instances".to_string(),
            private_key_secret: "cloud-private-key".to_string(),
            private_key_secret_key: "private-key.pem".to_string(),
            trust_bundle_namespace: "kube-system".to_string(),
            trust_bundle_configmap: "kube-root-ca.crt".to_string(),
            trust_bundle_key: "ca.crt".to_string(),
            converged_bundle_configmap: "winnode-converged-trust-bundle".to_string(),
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            bundle_filename: DEFAULT_BUNDLE_FILENAME.to_string(),
            payload_dir: None,
            bootstrap_command: "C:\\k\\bootstrap.ps1".to_string(),
            deconfigure_command: "C:\\k\\bootstrap.ps1 -Deconfigure".to_string(),
            storage_driver_migration: false,
            connect_poll: PollConfig::default(),
            convergence_poll: PollConfig::default(),
            node_registration_poll: PollConfig::default(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

impl ControllerConfig {
    /// Full remote path of the trust bundle file
    pub fn bundle_path(&self) -> String {
        winnode_transport::remote_path(&self.remote_dir, &self.bundle_filename)
    }
}
