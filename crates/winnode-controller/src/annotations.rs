//! JSON patch documents for Node annotations
//!
//! Version and bundle facts are persisted as annotations on the Node. Every
//! write goes through a [`PatchDocument`] so that a single API call either
//! applies all of its operations or none of them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use winnode_common::{Error, Result};

const ANNOTATIONS_PATH: &str = "/metadata/annotations/";

/// Patch operation kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Unconditional upsert
    Add,
    /// Delete; fails when the key does not exist
    Remove,
}

/// One RFC 6902 operation against an annotation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOperation {
    /// Operation kind
    pub op: PatchOp,
    /// JSON pointer to the annotation
    pub path: String,
    /// New value, present for `add`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Ordered list of annotation operations applied as one unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchDocument(Vec<PatchOperation>);

/// Escape an annotation key for use as a single JSON pointer segment
pub fn escape_key(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Build a document that upserts every entry of `annotations`
pub fn build_add_patch(annotations: &BTreeMap<String, String>) -> Result<PatchDocument> {
    if annotations.is_empty() {
        return Err(Error::input("annotations to add cannot be empty"));
    }
    Ok(PatchDocument(
        annotations
            .iter()
            .map(|(key, value)| PatchOperation {
                op: PatchOp::Add,
                path: format!("{ANNOTATIONS_PATH}{}", escape_key(key)),
                value: Some(value.clone()),
            })
            .collect(),
    ))
}

/// Build a document that removes every key in `keys`
pub fn build_remove_patch(keys: &BTreeSet<String>) -> Result<PatchDocument> {
    if keys.is_empty() {
        return Err(Error::input("annotations to remove cannot be empty"));
    }
    Ok(PatchDocument(
        keys.iter()
            .map(|key| PatchOperation {
                op: PatchOp::Remove,
                path: format!("{ANNOTATIONS_PATH}{}", escape_key(key)),
                value: None,
            })
            .collect(),
    ))
}

impl PatchDocument {
    /// Operations in application order
    pub fn operations(&self) -> &[PatchOperation] {
        &self.0
    }

    /// Serialized JSON patch body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Convert into the patch type accepted by `kube::api::Patch::Json`
    pub fn to_json_patch(&self) -> Result<json_patch::Patch> {
        let value = serde_json::to_value(self).map_err(|e| Error::serialization(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Apply to an in-memory annotation map.
    ///
    /// Either every operation applies or `annotations` is left untouched.
    /// Removing a key that does not exist fails the whole document.
    pub fn apply_to(&self, annotations: &mut BTreeMap<String, String>) -> Result<()> {
        let mut staged = annotations.clone();
        for operation in &self.0 {
            let key = operation
                .path
                .strip_prefix(ANNOTATIONS_PATH)
                .filter(|segment| !segment.is_empty() && !segment.contains('/'))
                .map(unescape_segment)
                .ok_or_else(|| {
                    Error::input_for_field(&operation.path, "path does not name an annotation")
                })?;

            match operation.op {
                PatchOp::Add => {
                    let value = operation.value.clone().ok_or_else(|| {
                        Error::input_for_field(&operation.path, "add operation without value")
                    })?;
                    staged.insert(key, value);
                }
                PatchOp::Remove => {
                    if staged.remove(&key).is_none() {
                        return Err(Error::input_for_field(
                            key,
                            "cannot remove annotation that does not exist",
                        ));
                    }
                }
            }
        }
        *annotations = staged;
        Ok(())
    }
}
