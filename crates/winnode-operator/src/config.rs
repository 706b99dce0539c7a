//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use winnode_common::{PollConfig, DEFAULT_OPERATOR_NAMESPACE};
use winnode_controller::config::{DEFAULT_BUNDLE_FILENAME, DEFAULT_REMOTE_DIR};
use winnode_controller::ControllerConfig;

/// winnode - brings externally provisioned Windows hosts under cluster management
#[derive(Parser, Debug, Clone)]
#[command(name = "winnode-operator", version = winnode_common::version(), about, long_about = None)]
pub struct Cli {
    /// Namespace holding the operator's own objects
    #[arg(long, env = "WINNODE_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    pub namespace: String,

    /// ConfigMap listing managed instances
    #[arg(long, env = "WINNODE_INSTANCE_CONFIGMAP", default_value = "windows-instances")]
    pub instance_configmap: String,

    /// Secret holding the SSH private key
    #[arg(long, env = "WINNODE_PRIVATE_KEY_SECRET", default_value = "cloud-private-key")]
    pub private_key_secret: String,

    /// Key within the private key Secret
    #[arg(long, env = "WINNODE_PRIVATE_KEY_SECRET_KEY", default_value = "private-key.pem")]
    pub private_key_secret_key: String,

    /// Namespace of the authoritative trust bundle ConfigMap
    #[arg(long, env = "WINNODE_TRUST_BUNDLE_NAMESPACE", default_value = "kube-system")]
    pub trust_bundle_namespace: String,

    /// ConfigMap holding the authoritative trust bundle
    #[arg(long, env = "WINNODE_TRUST_BUNDLE_CONFIGMAP", default_value = "kube-root-ca.crt")]
    pub trust_bundle_configmap: String,

    /// Key within the trust bundle ConfigMap
    #[arg(long, env = "WINNODE_TRUST_BUNDLE_KEY", default_value = "ca.crt")]
    pub trust_bundle_key: String,

    /// ConfigMap storing the last converged trust bundle
    #[arg(
        long,
        env = "WINNODE_CONVERGED_BUNDLE_CONFIGMAP",
        default_value = "winnode-converged-trust-bundle"
    )]
    pub converged_bundle_configmap: String,

    /// Directory for Kubernetes files on hosts
    #[arg(long, env = "WINNODE_REMOTE_DIR", default_value = DEFAULT_REMOTE_DIR)]
    pub remote_dir: String,

    /// Trust bundle filename on hosts
    #[arg(long, env = "WINNODE_BUNDLE_FILENAME", default_value = DEFAULT_BUNDLE_FILENAME)]
    pub bundle_filename: String,

    /// Local directory whose files are copied to every host during configuration
    #[arg(long, env = "WINNODE_PAYLOAD_DIR")]
    pub payload_dir: Option<PathBuf>,

    /// Command that configures a host to join the cluster
    #[arg(long, env = "WINNODE_BOOTSTRAP_COMMAND", default_value = "C:\\k\\bootstrap.ps1")]
    pub bootstrap_command: String,

    /// Command that removes a previous configuration before an upgrade
    #[arg(
        long,
        env = "WINNODE_DECONFIGURE_COMMAND",
        default_value = "C:\\k\\bootstrap.ps1 -Deconfigure"
    )]
    pub deconfigure_command: String,

    /// This version switches hosts from the in-tree storage driver to CSI
    #[arg(long, env = "WINNODE_STORAGE_DRIVER_MIGRATION")]
    pub storage_driver_migration: bool,

    /// SSH port on hosts
    #[arg(long, env = "WINNODE_SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// Seconds between connection attempts
    #[arg(long, env = "WINNODE_CONNECT_INTERVAL_SECS", default_value_t = 60)]
    pub connect_interval_secs: u64,

    /// Seconds before giving up on connecting to a host
    #[arg(long, env = "WINNODE_CONNECT_TIMEOUT_SECS", default_value_t = 600)]
    pub connect_timeout_secs: u64,

    /// Seconds between trust bundle checks on a host
    #[arg(long, env = "WINNODE_CONVERGENCE_INTERVAL_SECS", default_value_t = 60)]
    pub convergence_interval_secs: u64,

    /// Seconds before a host is reported as not converged
    #[arg(long, env = "WINNODE_CONVERGENCE_TIMEOUT_SECS", default_value_t = 600)]
    pub convergence_timeout_secs: u64,

    /// Seconds to wait for a configured host's Node to register
    #[arg(long, env = "WINNODE_NODE_REGISTRATION_TIMEOUT_SECS", default_value_t = 600)]
    pub node_registration_timeout_secs: u64,

    /// Seconds between full reconcile passes
    #[arg(long, env = "WINNODE_RECONCILE_INTERVAL_SECS", default_value_t = 300)]
    pub reconcile_interval_secs: u64,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "WINNODE_TEXT_LOGS")]
    pub text_logs: bool,
}

impl Cli {
    /// Controller settings derived from the command line
    pub fn controller_config(&self) -> ControllerConfig {
        let secs = Duration::from_secs;
        ControllerConfig {
            namespace: self.namespace.clone(),
            instance_configmap: self.instance_configmap.clone(),
            private_key_secret: self.private_key_secret.clone(),
            private_key_secret_key: self.private_key_secret_key.clone(),
            trust_bundle_namespace: self.trust_bundle_namespace.clone(),
            trust_bundle_configmap: self.trust_bundle_configmap.clone(),
            trust_bundle_key: self.trust_bundle_key.clone(),
            converged_bundle_configmap: self.converged_bundle_configmap.clone(),
            remote_dir: self.remote_dir.clone(),
            bundle_filename: self.bundle_filename.clone(),
            payload_dir: self.payload_dir.clone(),
            bootstrap_command: self.bootstrap_command.clone(),
            deconfigure_command: self.deconfigure_command.clone(),
            storage_driver_migration: self.storage_driver_migration,
            connect_poll: PollConfig::new(
                secs(self.connect_interval_secs),
                secs(self.connect_timeout_secs),
            ),
            convergence_poll: PollConfig::new(
                secs(self.convergence_interval_secs),
                secs(self.convergence_timeout_secs),
            ),
            node_registration_poll: PollConfig::new(
                secs(self.connect_interval_secs),
                secs(self.node_registration_timeout_secs),
            ),
            reconcile_interval: secs(self.reconcile_interval_secs),
        }
    }
}
