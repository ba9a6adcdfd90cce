//! Export orchestration: composes the app directory, config, launcher,
//! per-buildpack launch layers, and slice layers into the working image,
//! then finalizes labels, environment, and entrypoint.
//!
//! The sequence is strictly ordered. Slices mutate the app directory that
//! the app layer observes, the labels must reflect every prior step, and
//! the working image is owned exclusively for the duration of the export.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use strata_domain::{
    escape_identifier, load_build_metadata_optional, Buildpack, BuildMetadataLabel,
    BuildpackLayersMetadata, LayersMetadata, BUILD_METADATA_LABEL, LAYER_METADATA_LABEL,
};

use crate::archive::{self, HostOs};
use crate::env::{ENV_APP_DIR, ENV_LAYERS_DIR};
use crate::errors::ExportError;
use crate::image::Image;
use crate::layers::{self, read_buildpack_layers_dir};
use crate::slices::{self, SlicePlan};

/// Launcher binary plus the opaque metadata republished on the build label.
pub struct LauncherConfig {
    pub path: PathBuf,
    pub metadata: Value,
}

pub struct Exporter {
    pub buildpacks: Vec<Buildpack>,
    pub artifacts_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub host_os: HostOs,
}

impl Exporter {
    pub fn new(buildpacks: Vec<Buildpack>, artifacts_dir: PathBuf, uid: u32, gid: u32) -> Self {
        Self {
            buildpacks,
            artifacts_dir,
            uid,
            gid,
            host_os: HostOs::current(),
        }
    }

    /// Runs the full export against `image` and persists it under its
    /// primary name plus `additional_names`. `orig_metadata` is the layers
    /// label of the previous image and drives every reuse decision.
    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        layers_dir: &Path,
        app_dir: &Path,
        image: &mut dyn Image,
        run_image_ref: &str,
        orig_metadata: &LayersMetadata,
        additional_names: &[String],
        launcher: &LauncherConfig,
        stack: Value,
    ) -> Result<()> {
        fs::create_dir_all(&self.artifacts_dir)
            .with_context(|| format!("creating {}", self.artifacts_dir.display()))?;

        for required in [app_dir, launcher.path.as_path()] {
            if !required.exists() {
                return Err(ExportError::InputMissing {
                    path: required.to_path_buf(),
                }
                .into());
            }
        }

        let mut meta = LayersMetadata {
            stack,
            ..LayersMetadata::default()
        };
        meta.run_image.top_layer = image
            .top_layer()
            .context("get run image top layer digest")?;
        meta.run_image.reference = run_image_ref.to_string();

        let metadata_path = layers_dir.join("config").join("metadata.toml");
        let build_metadata = load_build_metadata_optional(&metadata_path)
            .context("failed to read metadata.toml")?
            .unwrap_or_default();

        let mut produced = BTreeSet::new();

        for slice in &build_metadata.slices {
            let Some(plan) = slices::resolve_slice(slice, app_dir)? else {
                continue;
            };
            claim_identifier(&mut produced, &plan.identifier)?;
            let previous = orig_metadata
                .app
                .get(&plan.identifier)
                .map(String::as_str)
                .unwrap_or_default();
            let sha = self
                .add_slice_layer(image, &plan, previous)
                .with_context(|| format!("exporting slice layer '{}'", plan.identifier))?;
            meta.app.insert(plan.identifier, sha);
        }

        claim_identifier(&mut produced, "app")?;
        let previous_app = orig_metadata
            .app
            .get("app")
            .map(String::as_str)
            .unwrap_or_default();
        let app_sha = self
            .add_layer(image, "app", app_dir, previous_app)
            .context("exporting app layer")?;
        meta.app.insert("app".to_string(), app_sha);

        claim_identifier(&mut produced, "config")?;
        meta.config.sha = self
            .add_layer(
                image,
                "config",
                &layers_dir.join("config"),
                &orig_metadata.config.sha,
            )
            .context("exporting config layer")?;

        claim_identifier(&mut produced, "launcher")?;
        meta.launcher.sha = self
            .add_layer(image, "launcher", &launcher.path, &orig_metadata.launcher.sha)
            .context("exporting launcher layer")?;

        for buildpack in &self.buildpacks {
            let bp_dir = read_buildpack_layers_dir(layers_dir, buildpack)
                .with_context(|| format!("reading layers for buildpack '{}'", buildpack.id))?;
            let mut bp_meta = BuildpackLayersMetadata {
                id: buildpack.id.clone(),
                version: buildpack.version.clone(),
                layers: Default::default(),
            };

            for layer in bp_dir.find_layers(layers::launch) {
                claim_identifier(&mut produced, layer.identifier())?;
                let mut layer_meta = layer.label_metadata();
                let orig_layer = orig_metadata.layer(&buildpack.id, layer.name());

                if layer.has_local_contents() {
                    let previous = orig_layer
                        .and_then(|l| l.sha.as_deref())
                        .unwrap_or_default();
                    let sha = self.add_layer(image, layer.identifier(), layer.path(), previous)?;
                    layer_meta.sha = Some(sha);
                } else {
                    if layer.is_cache() {
                        return Err(ExportError::ReuseImpossible {
                            layer: layer.identifier().to_string(),
                            reason: "cache=true but layer has no contents".to_string(),
                        }
                        .into());
                    }
                    let Some(previous) = orig_layer.and_then(|l| l.sha.as_deref()) else {
                        return Err(ExportError::ReuseImpossible {
                            layer: layer.identifier().to_string(),
                            reason: "previous image has no digest for this layer".to_string(),
                        }
                        .into());
                    };
                    info!(layer = %layer.identifier(), "reusing layer");
                    debug!(layer = %layer.identifier(), digest = %previous, "layer digest");
                    image.reuse_layer(previous).map_err(|cause| {
                        ExportError::IoFault {
                            layer: layer.identifier().to_string(),
                            cause,
                        }
                    })?;
                    layer_meta.sha = Some(previous.to_string());
                }
                bp_meta.layers.insert(layer.name().to_string(), layer_meta);
            }

            let malformed = bp_dir.find_layers(layers::malformed);
            if !malformed.is_empty() {
                let ids = malformed
                    .iter()
                    .map(|layer| layer.identifier().to_string())
                    .collect::<Vec<_>>();
                return Err(ExportError::InputMalformed {
                    subject: ids.join(", "),
                    reason: "failed to parse layer metadata".to_string(),
                }
                .into());
            }

            meta.buildpacks.push(bp_meta);
        }

        let encoded = serde_json::to_string(&meta).context("marshalling layers metadata")?;
        image
            .set_label(LAYER_METADATA_LABEL, &encoded)
            .context("set app image metadata label")?;

        let build_metadata = load_build_metadata_optional(&metadata_path)
            .context("read build metadata")?
            .unwrap_or_default();
        let build_label = BuildMetadataLabel {
            bom: build_metadata.bom,
            buildpacks: self.buildpacks.clone(),
            launcher: launcher.metadata.clone(),
        };
        let encoded =
            serde_json::to_string(&build_label).context("marshalling build metadata")?;
        image
            .set_label(BUILD_METADATA_LABEL, &encoded)
            .context("set build image metadata label")?;

        image
            .set_env(ENV_LAYERS_DIR, &layers_dir.to_string_lossy())
            .with_context(|| format!("set app image env {ENV_LAYERS_DIR}"))?;
        image
            .set_env(ENV_APP_DIR, &app_dir.to_string_lossy())
            .with_context(|| format!("set app image env {ENV_APP_DIR}"))?;

        image
            .set_entrypoint(&launcher.path.to_string_lossy())
            .context("setting entrypoint")?;
        image.set_cmd(&[]).context("setting cmd")?;

        image.save(additional_names).context("saving image")?;
        info!(image = %image.name(), "saved image");
        for name in additional_names {
            info!(image = %name, "saved image");
        }
        Ok(())
    }

    /// Adds one identified layer, reusing the previous layer when the
    /// freshly built tar carries the same digest.
    fn add_layer(
        &self,
        image: &mut dyn Image,
        identifier: &str,
        source: &Path,
        previous_sha: &str,
    ) -> Result<String> {
        let tar_path = self.tar_path(identifier);
        let sha = archive::write_dir_tar(source, &tar_path, self.uid, self.gid, self.host_os)
            .map_err(|cause| ExportError::IoFault {
                layer: identifier.to_string(),
                cause,
            })?;
        self.attach(image, identifier, &tar_path, &sha, previous_sha)?;
        Ok(sha)
    }

    /// Tars a slice's file set, removes the sliced files from the app
    /// directory, then attaches the layer.
    fn add_slice_layer(
        &self,
        image: &mut dyn Image,
        plan: &SlicePlan,
        previous_sha: &str,
    ) -> Result<String> {
        let tar_path = self.tar_path(&plan.identifier);
        let (sha, file_set) = archive::write_files_tar(
            &tar_path,
            self.uid,
            self.gid,
            self.host_os,
            &plan.files,
        )
        .map_err(|cause| ExportError::IoFault {
            layer: plan.identifier.clone(),
            cause,
        })?;
        debug!(layer = %plan.identifier, digest = %sha, "slice digest");

        for file in &file_set {
            match fs::symlink_metadata(file) {
                Ok(meta) if !meta.is_dir() => {
                    if let Err(err) = fs::remove_file(file) {
                        tracing::error!(path = %file.display(), %err, "failed to delete sliced file");
                    }
                }
                _ => {}
            }
        }

        self.attach(image, &plan.identifier, &tar_path, &sha, previous_sha)?;
        Ok(sha)
    }

    fn attach(
        &self,
        image: &mut dyn Image,
        identifier: &str,
        tar_path: &Path,
        sha: &str,
        previous_sha: &str,
    ) -> Result<()> {
        if sha == previous_sha {
            info!(layer = %identifier, "reusing layer");
            debug!(layer = %identifier, digest = %sha, "layer digest");
            return image.reuse_layer(previous_sha).map_err(|cause| {
                ExportError::IoFault {
                    layer: identifier.to_string(),
                    cause,
                }
                .into()
            });
        }
        info!(layer = %identifier, "adding layer");
        debug!(layer = %identifier, digest = %sha, "layer digest");
        image.add_layer(tar_path).map_err(|cause| {
            ExportError::IoFault {
                layer: identifier.to_string(),
                cause,
            }
            .into()
        })
    }

    fn tar_path(&self, identifier: &str) -> PathBuf {
        self.artifacts_dir
            .join(format!("{}.tar", escape_identifier(identifier)))
    }
}

fn claim_identifier(produced: &mut BTreeSet<String>, identifier: &str) -> Result<()> {
    if !produced.insert(identifier.to_string()) {
        return Err(ExportError::NameCollision {
            layer: identifier.to_string(),
        }
        .into());
    }
    Ok(())
}
