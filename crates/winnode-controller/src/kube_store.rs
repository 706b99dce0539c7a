//! Kubernetes-backed collaborators
//!
//! [`KubeClusterStore`] reads the inventory and trust bundle ConfigMaps and
//! patches Node annotations. [`KubeVolumeStats`] asks each kubelet (through
//! the API server proxy) which volumes its pods mount and resolves claims to
//! in-tree vSphere disks. [`SecretCredentialProvider`] loads the SSH key.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, PersistentVolume, PersistentVolumeClaim, Secret,
};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use serde::Deserialize;
use tracing::debug;

use winnode_common::retry::{retry_with_backoff, RetryConfig};
use winnode_common::{Error, Result, WINDOWS_OS_LABEL_SELECTOR};
use winnode_transport::Credential;

use crate::annotations::PatchDocument;
use crate::config::ControllerConfig;
use crate::controller::{ClusterStore, CredentialProvider, VolumeStatsSource};
use crate::instances::node_has_address;
use crate::upgrade_gate::LiveVolume;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "winnode-operator";

/// Field manager owning the pending bundle key. Each key has its own
/// manager so that applying one never removes the other.
pub const PENDING_FIELD_MANAGER: &str = "winnode-operator-pending";

/// Key holding the converged bundle in its ConfigMap
pub const CONVERGED_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Key holding the pending bundle in the converged bundle ConfigMap
pub const PENDING_BUNDLE_KEY: &str = "pending-ca-bundle.crt";

/// [`ClusterStore`] over the Kubernetes API
pub struct KubeClusterStore {
    client: Client,
    namespace: String,
    instance_configmap: String,
    trust_bundle_namespace: String,
    trust_bundle_configmap: String,
    trust_bundle_key: String,
    converged_bundle_configmap: String,
    retry: RetryConfig,
}

impl KubeClusterStore {
    /// Create a store for the objects named in `config`
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            instance_configmap: config.instance_configmap.clone(),
            trust_bundle_namespace: config.trust_bundle_namespace.clone(),
            trust_bundle_configmap: config.trust_bundle_configmap.clone(),
            trust_bundle_key: config.trust_bundle_key.clone(),
            converged_bundle_configmap: config.converged_bundle_configmap.clone(),
            retry: RetryConfig::default(),
        }
    }

    async fn configmap_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn stored_bundle(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .configmap_data(&self.namespace, &self.converged_bundle_configmap)
            .await?
            .and_then(|mut data| data.remove(key)))
    }

    /// Server-side apply `data` to the bundle ConfigMap as `manager`. Keys the
    /// manager applied before and that are absent from `data` are removed.
    async fn apply_bundle_data(
        &self,
        manager: &str,
        data: BTreeMap<String, String>,
        operation: &str,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.converged_bundle_configmap.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        retry_with_backoff(&self.retry, operation, || {
            let api = api.clone();
            let configmap = configmap.clone();
            let name = self.converged_bundle_configmap.clone();
            async move {
                api.patch(
                    &name,
                    &PatchParams::apply(manager).force(),
                    &Patch::Apply(&configmap),
                )
                .await?;
                Ok(())
            }
        })
        .await
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn list_instance_entries(&self) -> Result<BTreeMap<String, String>> {
        let data = self
            .configmap_data(&self.namespace, &self.instance_configmap)
            .await?;
        if data.is_none() {
            debug!(configmap = %self.instance_configmap, "instance ConfigMap not found");
        }
        Ok(data.unwrap_or_default())
    }

    async fn list_windows_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(WINDOWS_OS_LABEL_SELECTOR))
            .await?;
        Ok(nodes.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn find_node_by_address(&self, address: &str) -> Result<Option<Node>> {
        Ok(self
            .list_windows_nodes()
            .await?
            .into_iter()
            .find(|node| node_has_address(node, address)))
    }

    async fn patch_node_annotations(&self, name: &str, patch: &PatchDocument) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let json_patch = patch.to_json_patch()?;

        retry_with_backoff(&self.retry, "patch node annotations", || {
            let api = api.clone();
            let json_patch = json_patch.clone();
            async move {
                api.patch(name, &PatchParams::default(), &Patch::<()>::Json(json_patch))
                    .await?;
                Ok(())
            }
        })
        .await?;

        debug!(node = name, operations = patch.operations().len(), "patched node annotations");
        Ok(())
    }

    async fn get_trust_bundle(&self) -> Result<Option<String>> {
        Ok(self
            .configmap_data(&self.trust_bundle_namespace, &self.trust_bundle_configmap)
            .await?
            .and_then(|mut data| data.remove(&self.trust_bundle_key)))
    }

    async fn get_converged_bundle(&self) -> Result<Option<String>> {
        self.stored_bundle(CONVERGED_BUNDLE_KEY).await
    }

    async fn put_converged_bundle(&self, pem: &str) -> Result<()> {
        self.apply_bundle_data(
            FIELD_MANAGER,
            BTreeMap::from([(CONVERGED_BUNDLE_KEY.to_string(), pem.to_string())]),
            "store converged trust bundle",
        )
        .await
    }

    async fn get_pending_bundle(&self) -> Result<Option<String>> {
        self.stored_bundle(PENDING_BUNDLE_KEY).await
    }

    async fn put_pending_bundle(&self, pem: &str) -> Result<()> {
        self.apply_bundle_data(
            PENDING_FIELD_MANAGER,
            BTreeMap::from([(PENDING_BUNDLE_KEY.to_string(), pem.to_string())]),
            "store pending trust bundle",
        )
        .await
    }

    async fn clear_pending_bundle(&self) -> Result<()> {
        self.apply_bundle_data(PENDING_FIELD_MANAGER, BTreeMap::new(), "clear pending trust bundle")
            .await
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatsSummary {
    #[serde(default)]
    pods: Vec<PodStats>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStats {
    #[serde(default)]
    volume: Vec<VolumeStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeStats {
    name: String,
    pvc_ref: Option<PvcReference>,
}

#[derive(Debug, Deserialize)]
struct PvcReference {
    name: String,
    namespace: String,
}

/// [`VolumeStatsSource`] backed by the kubelet stats summary
pub struct KubeVolumeStats {
    client: Client,
}

impl KubeVolumeStats {
    /// Create a source using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn summary(&self, node: &str) -> Result<StatsSummary> {
        let request = http::Request::get(format!("/api/v1/nodes/{node}/proxy/stats/summary"))
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("stats summary", e.to_string()))?;
        Ok(self.client.request::<StatsSummary>(request).await?)
    }

    /// In-tree vSphere disk backing a claim, if any
    async fn in_tree_path(&self, pvc: &PvcReference) -> Result<Option<String>> {
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc.namespace);
        let Some(volume_name) = claims
            .get_opt(&pvc.name)
            .await?
            .and_then(|claim| claim.spec)
            .and_then(|spec| spec.volume_name)
        else {
            return Ok(None);
        };

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(volumes
            .get_opt(&volume_name)
            .await?
            .and_then(|pv| pv.spec)
            .and_then(|spec| spec.vsphere_volume)
            .map(|source| source.volume_path))
    }
}

#[async_trait]
impl VolumeStatsSource for KubeVolumeStats {
    async fn live_volumes(&self, node: &str) -> Result<Vec<LiveVolume>> {
        let summary = self.summary(node).await?;

        let mut live = Vec::new();
        for volume in summary.pods.into_iter().flat_map(|pod| pod.volume) {
            let in_tree_path = match &volume.pvc_ref {
                Some(pvc) => self.in_tree_path(pvc).await?,
                None => None,
            };
            live.push(LiveVolume {
                name: volume.name,
                in_tree_path,
            });
        }
        debug!(node, volumes = live.len(), "collected live volumes");
        Ok(live)
    }
}

/// [`CredentialProvider`] reading the private key from a Secret
pub struct SecretCredentialProvider {
    client: Client,
    namespace: String,
    secret: String,
    key: String,
}

impl SecretCredentialProvider {
    /// Create a provider for the Secret named in `config`
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            secret: config.private_key_secret.clone(),
            key: config.private_key_secret_key.clone(),
        }
    }
}

#[async_trait]
impl CredentialProvider for SecretCredentialProvider {
    async fn credential(&self) -> Result<Credential> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get_opt(&self.secret).await?.ok_or_else(|| {
            Error::input_for_field(&self.secret, "private key secret not found")
        })?;

        let bytes = secret
            .data
            .and_then(|mut data| data.remove(&self.key))
            .ok_or_else(|| {
                Error::input_for_field(&self.key, format!("key missing from secret {}", self.secret))
            })?;
        let pem = String::from_utf8(bytes.0)
            .map_err(|_| Error::input_for_field(&self.key, "private key is not valid UTF-8"))?;
        Ok(Credential::from_private_key_pem(pem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_summary_parses_kubelet_output() {
        let json = serde_json::json!({
            "node": {"nodeName": "win-1"},
            "pods": [
                {
                    "podRef": {"name": "web-0", "namespace": "default"},
                    "volume": [
                        {"name": "data", "pvcRef": {"name": "data-web-0", "namespace": "default"}},
                        {"name": "kube-api-access"}
                    ]
                },
                {"podRef": {"name": "idle", "namespace": "default"}}
            ]
        });

        let summary: StatsSummary = serde_json::from_value(json).expect("summary");

        let volumes: Vec<_> = summary.pods.into_iter().flat_map(|p| p.volume).collect();
        assert_eq!(volumes.len(), 2);
        let pvc = volumes[0].pvc_ref.as_ref().expect("pvc ref");
        assert_eq!((pvc.namespace.as_str(), pvc.name.as_str()), ("default", "data-web-0"));
        assert!(volumes[1].pvc_ref.is_none());
    }
}
