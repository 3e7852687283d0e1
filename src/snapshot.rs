//! Append-only snapshot chain.
//!
//! A snapshot is a base image plus an ordered sequence of immutable layers,
//! one per completed pipeline step. Layer identity is a sha256 chain: each
//! id commits to its parent, the step fingerprint, and the stored diff
//! blob, so the sequence is totally ordered and cannot be rewritten.

use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::step::BaseImage;

/// Content-derived layer identifier (64 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LayerId(String);

// Manifests are hand-editable JSON, so deserialization enforces the same
// shape check as `from_hex`.
impl<'de> Deserialize<'de> for LayerId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if !is_hex_64(&raw) {
            return Err(serde::de::Error::custom(format!("invalid layer id: {raw}")));
        }
        Ok(Self(raw))
    }
}

impl LayerId {
    pub fn from_hex(hex: &str) -> Result<Self> {
        if !is_hex_64(hex) {
            bail!("invalid layer id: {hex}");
        }
        Ok(Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One layer in a snapshot: the diff produced by exactly one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    pub step_name: String,
}

/// An immutable, ordered composition of a base image and layers.
///
/// The only mutation is appending a layer; existing layers are never
/// touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    base: BaseImage,
    layers: Vec<LayerRecord>,
}

impl Snapshot {
    pub fn of_base(base: BaseImage) -> Self {
        Self {
            base,
            layers: Vec::new(),
        }
    }

    pub fn base(&self) -> &BaseImage {
        &self.base
    }

    pub fn layers(&self) -> &[LayerRecord] {
        &self.layers
    }

    /// Id of the topmost layer, if any step has completed.
    pub fn head(&self) -> Option<&LayerId> {
        self.layers.last().map(|layer| &layer.id)
    }

    pub fn push_layer(&mut self, record: LayerRecord) {
        self.layers.push(record);
    }
}

/// Derive the id of the next layer in a chain.
///
/// `parent` is `None` for the first layer on top of the base image.
pub fn chain_layer_id(
    base: &BaseImage,
    parent: Option<&LayerId>,
    step_fingerprint: &str,
    diff_blob_sha256: &str,
) -> LayerId {
    let mut hasher = Sha256::new();
    hasher.update(b"base:");
    hasher.update(base.reference().as_bytes());
    hasher.update(b"\nparent:");
    match parent {
        Some(id) => hasher.update(id.as_str().as_bytes()),
        None => hasher.update(b"-"),
    }
    hasher.update(b"\nstep:");
    hasher.update(step_fingerprint.as_bytes());
    hasher.update(b"\ndiff:");
    hasher.update(diff_blob_sha256.as_bytes());
    LayerId(format!("{:x}", hasher.finalize()))
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
