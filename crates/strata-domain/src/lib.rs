#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod build;
pub mod buildpack;
pub mod metadata;

pub use build::{
    json_from_item, load_build_metadata, load_build_metadata_optional, parse_build_metadata,
    BuildMetadata, Slice,
};
pub use buildpack::{escape_identifier, Buildpack};
pub use metadata::{
    BuildMetadataLabel, BuildpackLayerMetadata, BuildpackLayersMetadata, LayerDigest,
    LayersMetadata, RunImageMetadata, BUILD_METADATA_LABEL, LAYER_METADATA_LABEL,
};
