use std::path::PathBuf;

/// Failure classes surfaced by the export pipeline. Nested into `anyhow`
/// chains at the point of detection; callers recover the class with
/// `err.downcast_ref::<ExportError>()`.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("required input missing at {}", path.display())]
    InputMissing { path: PathBuf },

    #[error("malformed input for '{subject}': {reason}")]
    InputMalformed { subject: String, reason: String },

    #[error("cannot reuse layer '{layer}': {reason}")]
    ReuseImpossible { layer: String, reason: String },

    #[error("layer '{layer}': {cause}")]
    IoFault {
        layer: String,
        cause: anyhow::Error,
    },

    #[error("duplicate layer identifier '{layer}'")]
    NameCollision { layer: String },
}
