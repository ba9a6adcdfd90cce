use serde::{Deserialize, Serialize};

/// One entry of the buildpack group that contributed to the build, in
/// declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buildpack {
    pub id: String,
    pub version: String,
}

/// Escapes a layer or buildpack identifier for use as a file name. The
/// mapping is stable across runs; it is not required to be reversible.
pub fn escape_identifier(id: &str) -> String {
    id.replace(['/', ':'], "_")
}
