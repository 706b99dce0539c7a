//! Upgrade gate for storage driver migration
//!
//! Switching a node from the in-tree vSphere driver to the CSI driver while a
//! pod still holds an in-tree mount would orphan that mount. The gate defers
//! such upgrades until no in-tree volume is attached to the node.
//!
//! Only the node being upgraded is inspected. In-tree volumes attached to
//! other nodes do not block it.

use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use winnode_common::{ALLOW_UPGRADE_LABEL, STORAGE_MIGRATED_LABEL};

/// Prefix the attach/detach controller uses for in-tree vSphere volumes
pub const IN_TREE_VOLUME_PREFIX: &str = "kubernetes.io/vsphere-volume/";

/// A volume currently mounted by a pod on the node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveVolume {
    /// Volume name within the pod
    pub name: String,
    /// Backing in-tree volume path, when the volume is served by the old driver
    pub in_tree_path: Option<String>,
}

impl LiveVolume {
    /// A volume backed by the in-tree driver at `path`
    pub fn in_tree(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_tree_path: Some(path.into()),
        }
    }

    /// A volume served by any other driver
    pub fn other(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_tree_path: None,
        }
    }
}

fn has_label(node: &Node, label: &str) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(label))
}

/// Whether reconfiguring `node` must wait.
///
/// Never blocked when the node already finished migration, when an
/// administrator set the allow-upgrade label, or when this upgrade does not
/// switch drivers. Otherwise blocked iff a volume attached to the node is
/// backed by the in-tree path of a live volume.
pub fn upgrade_blocked(node: &Node, migrating_to_new_driver: bool, live: &[LiveVolume]) -> bool {
    let name = node.metadata.name.as_deref().unwrap_or_default();

    if has_label(node, STORAGE_MIGRATED_LABEL) {
        debug!(node = name, "storage driver already migrated");
        return false;
    }
    if has_label(node, ALLOW_UPGRADE_LABEL) {
        debug!(node = name, "upgrade explicitly allowed");
        return false;
    }
    if !migrating_to_new_driver {
        return false;
    }

    let attached = node
        .status
        .as_ref()
        .and_then(|s| s.volumes_attached.as_ref());
    let Some(attached) = attached else {
        return false;
    };

    attached.iter().any(|volume| {
        let path = volume
            .name
            .strip_prefix(IN_TREE_VOLUME_PREFIX)
            .unwrap_or(&volume.name);
        let blocking = live
            .iter()
            .any(|lv| lv.in_tree_path.as_deref() == Some(path));
        if blocking {
            debug!(node = name, volume = %volume.name, "in-tree volume in use");
        }
        blocking
    })
}
