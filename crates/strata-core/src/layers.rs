//! Reader for per-buildpack layer trees.
//!
//! A buildpack's directory under the layers root contains `<name>/`
//! directories and `<name>.toml` sidecars. The sidecar declares the
//! `launch`, `build`, and `cache` flags plus arbitrary metadata; the
//! directory holds the layer contents when the build produced any.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use toml_edit::{DocumentMut, Item};

use strata_domain::{escape_identifier, json_from_item, Buildpack, BuildpackLayerMetadata};

pub struct BuildpackLayersDir {
    layers: Vec<BuildpackLayer>,
}

pub struct BuildpackLayer {
    name: String,
    identifier: String,
    path: PathBuf,
    has_local_contents: bool,
    metadata: Option<SidecarMetadata>,
    malformed: bool,
}

#[derive(Clone, Debug, Default)]
struct SidecarMetadata {
    launch: bool,
    build: bool,
    cache: bool,
    sha: Option<String>,
    data: Value,
}

/// Enumerates the layers contributed by `buildpack` under `layers_dir`, in
/// lexicographic order of layer name. A buildpack directory that does not
/// exist yields an empty set.
pub fn read_buildpack_layers_dir(
    layers_dir: &Path,
    buildpack: &Buildpack,
) -> Result<BuildpackLayersDir> {
    let dir = layers_dir.join(escape_identifier(&buildpack.id));
    let mut names = BTreeSet::new();
    match fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries {
                let entry =
                    entry.with_context(|| format!("reading {}", dir.display()))?;
                let path = entry.path();
                if path.is_dir() {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        names.insert(name.to_string());
                    }
                } else if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|n| n.to_str()) {
                        names.insert(stem.to_string());
                    }
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", dir.display()));
        }
    }

    let mut layers = Vec::with_capacity(names.len());
    for name in names {
        layers.push(read_layer(&dir, &buildpack.id, &name)?);
    }
    Ok(BuildpackLayersDir { layers })
}

fn read_layer(dir: &Path, buildpack_id: &str, name: &str) -> Result<BuildpackLayer> {
    let path = dir.join(name);
    let sidecar = dir.join(format!("{name}.toml"));
    let has_local_contents = path.is_dir();

    let (metadata, malformed) = if sidecar.is_file() {
        let contents = fs::read_to_string(&sidecar)
            .with_context(|| format!("reading {}", sidecar.display()))?;
        match parse_sidecar(&contents) {
            Ok(metadata) => (Some(metadata), false),
            Err(err) => {
                tracing::debug!(path = %sidecar.display(), %err, "unparsable layer sidecar");
                (None, true)
            }
        }
    } else {
        // A materialized layer directory with no sidecar cannot be
        // attributed flags.
        (None, has_local_contents)
    };

    Ok(BuildpackLayer {
        name: name.to_string(),
        identifier: format!("{buildpack_id}.{name}"),
        path,
        has_local_contents,
        metadata,
        malformed,
    })
}

fn parse_sidecar(contents: &str) -> Result<SidecarMetadata> {
    let doc: DocumentMut = contents.parse().context("invalid TOML")?;
    Ok(SidecarMetadata {
        launch: doc.get("launch").and_then(Item::as_bool).unwrap_or(false),
        build: doc.get("build").and_then(Item::as_bool).unwrap_or(false),
        cache: doc.get("cache").and_then(Item::as_bool).unwrap_or(false),
        sha: doc
            .get("sha")
            .and_then(Item::as_str)
            .map(str::to_string),
        data: doc.get("metadata").map(json_from_item).unwrap_or(Value::Null),
    })
}

impl BuildpackLayersDir {
    pub fn find_layers(&self, pred: impl Fn(&BuildpackLayer) -> bool) -> Vec<&BuildpackLayer> {
        self.layers.iter().filter(|layer| pred(layer)).collect()
    }
}

/// Flag filters for [`BuildpackLayersDir::find_layers`].
pub fn launch(layer: &BuildpackLayer) -> bool {
    layer.metadata.as_ref().is_some_and(|m| m.launch)
}

pub fn build(layer: &BuildpackLayer) -> bool {
    layer.metadata.as_ref().is_some_and(|m| m.build)
}

pub fn cached(layer: &BuildpackLayer) -> bool {
    layer.metadata.as_ref().is_some_and(|m| m.cache)
}

pub fn malformed(layer: &BuildpackLayer) -> bool {
    layer.malformed
}

impl BuildpackLayer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted identifier, `<buildpack-id>.<layer-name>`.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// On-disk layer directory; only meaningful when
    /// [`BuildpackLayer::has_local_contents`] holds.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_local_contents(&self) -> bool {
        self.has_local_contents
    }

    pub fn is_cache(&self) -> bool {
        cached(self)
    }

    /// The sidecar metadata shaped for the layers label: flags, opaque data
    /// blob, and the sha recorded by a previous phase when present.
    pub fn label_metadata(&self) -> BuildpackLayerMetadata {
        let metadata = self.metadata.clone().unwrap_or_default();
        BuildpackLayerMetadata {
            sha: metadata.sha,
            build: metadata.build,
            launch: metadata.launch,
            cache: metadata.cache,
            data: metadata.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn buildpack(id: &str) -> Buildpack {
        Buildpack {
            id: id.to_string(),
            version: "1.0".to_string(),
        }
    }

    #[test]
    fn classifies_and_orders_layers() -> Result<()> {
        let temp = tempdir()?;
        let bp_dir = temp.path().join("example_node");
        fs::create_dir_all(bp_dir.join("runtime"))?;
        fs::write(bp_dir.join("runtime.toml"), "launch = true\n")?;
        fs::create_dir_all(bp_dir.join("build-deps"))?;
        fs::write(bp_dir.join("build-deps.toml"), "build = true\n")?;
        fs::write(bp_dir.join("cached.toml"), "launch = true\ncache = true\n")?;

        let dir = read_buildpack_layers_dir(temp.path(), &buildpack("example/node"))?;

        let launch_layers = dir.find_layers(launch);
        assert_eq!(
            launch_layers
                .iter()
                .map(|l| l.name())
                .collect::<Vec<_>>(),
            vec!["cached", "runtime"],
        );
        assert!(!launch_layers[0].has_local_contents());
        assert!(launch_layers[1].has_local_contents());
        assert_eq!(launch_layers[1].identifier(), "example/node.runtime");

        assert_eq!(dir.find_layers(build).len(), 1);
        assert_eq!(dir.find_layers(cached).len(), 1);
        assert!(dir.find_layers(malformed).is_empty());
        Ok(())
    }

    #[test]
    fn unparsable_sidecar_is_malformed() -> Result<()> {
        let temp = tempdir()?;
        let bp_dir = temp.path().join("bp1");
        fs::create_dir_all(&bp_dir)?;
        fs::write(bp_dir.join("broken.toml"), "launch = [")?;

        let dir = read_buildpack_layers_dir(temp.path(), &buildpack("bp1"))?;
        let bad = dir.find_layers(malformed);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].identifier(), "bp1.broken");
        assert!(dir.find_layers(launch).is_empty());
        Ok(())
    }

    #[test]
    fn bare_directory_without_sidecar_is_malformed() -> Result<()> {
        let temp = tempdir()?;
        fs::create_dir_all(temp.path().join("bp1").join("orphan"))?;

        let dir = read_buildpack_layers_dir(temp.path(), &buildpack("bp1"))?;
        let bad = dir.find_layers(malformed);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].name(), "orphan");
        Ok(())
    }

    #[test]
    fn sidecar_data_and_sha_pass_through() -> Result<()> {
        let temp = tempdir()?;
        let bp_dir = temp.path().join("bp1");
        fs::create_dir_all(&bp_dir)?;
        fs::write(
            bp_dir.join("lib.toml"),
            r#"
launch = true
sha = "sha256:feed"

[metadata]
version = "2.4.6"
paths = ["bin", "lib"]
"#,
        )?;

        let dir = read_buildpack_layers_dir(temp.path(), &buildpack("bp1"))?;
        let layers = dir.find_layers(launch);
        let meta = layers[0].label_metadata();
        assert_eq!(meta.sha.as_deref(), Some("sha256:feed"));
        assert!(meta.launch);
        assert_eq!(meta.data, json!({"version": "2.4.6", "paths": ["bin", "lib"]}));
        Ok(())
    }

    #[test]
    fn missing_buildpack_dir_yields_no_layers() -> Result<()> {
        let temp = tempdir()?;
        let dir = read_buildpack_layers_dir(temp.path(), &buildpack("absent"))?;
        assert!(dir.find_layers(|_| true).is_empty());
        Ok(())
    }
}
