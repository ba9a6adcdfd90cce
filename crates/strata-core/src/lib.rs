#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod archive;
pub mod env;
pub mod errors;
pub mod export;
pub mod image;
pub mod layers;
pub mod slices;

pub use archive::{extract_tar, write_dir_tar, write_files_tar, HostOs};
pub use errors::ExportError;
pub use export::{Exporter, LauncherConfig};
pub use image::Image;
pub use layers::{read_buildpack_layers_dir, BuildpackLayer, BuildpackLayersDir};
pub use slices::{resolve_slice, slice_identifier, SlicePlan};
