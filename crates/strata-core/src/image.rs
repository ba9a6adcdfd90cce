use std::path::Path;

use anyhow::Result;

/// The image manipulation capability consumed by the export orchestrator.
/// Implementations wrap a registry or daemon client; the orchestrator owns
/// the image exclusively for the duration of an export and mutates it in
/// place until [`Image::save`] persists it.
pub trait Image: Send + Sync {
    /// Reference the image was opened under.
    fn name(&self) -> &str;

    /// Digest of the topmost layer of the underlying run image.
    fn top_layer(&self) -> Result<String>;

    /// Appends the tar at `tar_path` as a new layer.
    fn add_layer(&mut self, tar_path: &Path) -> Result<()>;

    /// Re-attaches a layer already present in the previous image by digest.
    /// Fails when the digest is unknown to the image's base.
    fn reuse_layer(&mut self, digest: &str) -> Result<()>;

    fn set_label(&mut self, key: &str, value: &str) -> Result<()>;

    fn set_env(&mut self, key: &str, value: &str) -> Result<()>;

    fn set_entrypoint(&mut self, entrypoint: &str) -> Result<()>;

    fn set_cmd(&mut self, cmd: &[String]) -> Result<()>;

    /// Persists the image under its primary name and every additional name.
    /// Partial success across names is reported as an error.
    fn save(&mut self, additional_names: &[String]) -> Result<()>;
}
