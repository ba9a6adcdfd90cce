//! JSON models for the two labels written onto the exported image.
//!
//! `LayersMetadata` is the cross-build ledger: it records the digest of every
//! exported layer so the next export can decide reuse-vs-rebuild without
//! pulling the previous image. `BuildMetadataLabel` republishes the build
//! plan (BOM, buildpack group, launcher metadata) for tooling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buildpack::Buildpack;

/// Label carrying the serialized [`LayersMetadata`].
pub const LAYER_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

/// Label carrying the serialized [`BuildMetadataLabel`].
pub const BUILD_METADATA_LABEL: &str = "io.buildpacks.build.metadata";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LayersMetadata {
    /// Digests of the app layer and every slice layer, keyed by identifier.
    #[serde(default)]
    pub app: BTreeMap<String, String>,
    #[serde(default)]
    pub config: LayerDigest,
    #[serde(default)]
    pub launcher: LayerDigest,
    #[serde(default, rename = "runImage")]
    pub run_image: RunImageMetadata,
    /// Opaque stack descriptor, carried through verbatim.
    #[serde(default)]
    pub stack: Value,
    /// Per-buildpack layer records, in group declaration order.
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

impl LayersMetadata {
    pub fn buildpack(&self, id: &str) -> Option<&BuildpackLayersMetadata> {
        self.buildpacks.iter().find(|bp| bp.id == id)
    }

    pub fn layer(&self, buildpack_id: &str, name: &str) -> Option<&BuildpackLayerMetadata> {
        self.buildpack(buildpack_id)
            .and_then(|bp| bp.layers.get(name))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDigest {
    #[serde(default)]
    pub sha: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default, rename = "topLayer")]
    pub top_layer: String,
    #[serde(default)]
    pub reference: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildpackLayersMetadata {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, BuildpackLayerMetadata>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildpackLayerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub cache: bool,
    /// Arbitrary structured metadata from the layer sidecar, preserved
    /// verbatim across rebuilds.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildMetadataLabel {
    #[serde(default)]
    pub bom: Vec<Value>,
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
    #[serde(default)]
    pub launcher: Value,
}
