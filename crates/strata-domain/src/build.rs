//! Build metadata as written by the build phase to
//! `<layersDir>/config/metadata.toml`.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use toml_edit::{DocumentMut, Item, Table, Value as TomlValue};

use crate::buildpack::Buildpack;

#[derive(Clone, Debug, Default)]
pub struct BuildMetadata {
    /// Bill of materials, opaque entries carried through to the build label.
    pub bom: Vec<Value>,
    pub buildpacks: Vec<Buildpack>,
    pub slices: Vec<Slice>,
}

/// A user-declared subset of the app directory, promoted to its own layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Slice {
    pub paths: Vec<String>,
}

pub fn load_build_metadata(path: &Path) -> Result<BuildMetadata> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_build_metadata(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))
}

pub fn load_build_metadata_optional(path: &Path) -> Result<Option<BuildMetadata>> {
    if path.exists() {
        Ok(Some(load_build_metadata(path)?))
    } else {
        Ok(None)
    }
}

pub fn parse_build_metadata(contents: &str) -> Result<BuildMetadata> {
    let doc: DocumentMut = contents.parse().context("invalid TOML")?;

    let bom = match doc.get("bom").map(json_from_item) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(_) => bail!("`bom` must be an array"),
    };

    let buildpacks = match doc.get("buildpacks").map(json_from_item) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .map(buildpack_from_json)
            .collect::<Result<_>>()?,
        Some(_) => bail!("`buildpacks` must be an array"),
    };

    let slices = match doc.get("slices").map(json_from_item) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .map(slice_from_json)
            .collect::<Result<_>>()?,
        Some(_) => bail!("`slices` must be an array"),
    };

    Ok(BuildMetadata {
        bom,
        buildpacks,
        slices,
    })
}

fn buildpack_from_json(entry: Value) -> Result<Buildpack> {
    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .context("buildpack entry is missing `id`")?
        .to_string();
    let version = entry
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Buildpack { id, version })
}

fn slice_from_json(entry: Value) -> Result<Slice> {
    let mut paths = Vec::new();
    if let Some(values) = entry.get("paths").and_then(Value::as_array) {
        for value in values {
            let path = value
                .as_str()
                .context("slice `paths` entries must be strings")?;
            paths.push(path.to_string());
        }
    }
    Ok(Slice { paths })
}

/// Converts a TOML item into JSON, preserving table key order. Datetimes
/// are carried as their literal string form.
pub fn json_from_item(item: &Item) -> Value {
    match item {
        Item::None => Value::Null,
        Item::Value(value) => json_from_value(value),
        Item::Table(table) => json_from_table(table),
        Item::ArrayOfTables(tables) => {
            Value::Array(tables.iter().map(json_from_table).collect())
        }
    }
}

fn json_from_table(table: &Table) -> Value {
    Value::Object(
        table
            .iter()
            .map(|(key, item)| (key.to_string(), json_from_item(item)))
            .collect(),
    )
}

fn json_from_value(value: &TomlValue) -> Value {
    match value {
        TomlValue::String(s) => Value::String(s.value().clone()),
        TomlValue::Integer(i) => Value::from(*i.value()),
        TomlValue::Float(f) => serde_json::Number::from_f64(*f.value())
            .map(Value::Number)
            .unwrap_or(Value::Null),
        TomlValue::Boolean(b) => Value::Bool(*b.value()),
        TomlValue::Datetime(dt) => Value::String(dt.value().to_string()),
        TomlValue::Array(values) => {
            Value::Array(values.iter().map(json_from_value).collect())
        }
        TomlValue::InlineTable(table) => Value::Object(
            table
                .iter()
                .map(|(key, value)| (key.to_string(), json_from_value(value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slices_and_buildpacks() {
        let metadata = parse_build_metadata(
            r#"
[[buildpacks]]
id = "example/node"
version = "1.2.3"

[[buildpacks]]
id = "example/npm"
version = "0.1.0"

[[slices]]
paths = ["static/**", "*.html"]

[[slices]]
paths = ["logs/*.log"]
"#,
        )
        .expect("parse");

        assert_eq!(metadata.buildpacks.len(), 2);
        assert_eq!(metadata.buildpacks[0].id, "example/node");
        assert_eq!(metadata.buildpacks[1].version, "0.1.0");
        assert_eq!(
            metadata.slices,
            vec![
                Slice {
                    paths: vec!["static/**".to_string(), "*.html".to_string()],
                },
                Slice {
                    paths: vec!["logs/*.log".to_string()],
                },
            ]
        );
    }

    #[test]
    fn bom_entries_pass_through_as_json() {
        let metadata = parse_build_metadata(
            r#"
[[bom]]
name = "node"
[bom.metadata]
version = "18.2.0"
licenses = ["MIT"]
"#,
        )
        .expect("parse");

        assert_eq!(metadata.bom.len(), 1);
        assert_eq!(metadata.bom[0]["name"], "node");
        assert_eq!(metadata.bom[0]["metadata"]["version"], "18.2.0");
        assert_eq!(metadata.bom[0]["metadata"]["licenses"][0], "MIT");
    }

    #[test]
    fn empty_document_yields_empty_metadata() {
        let metadata = parse_build_metadata("").expect("parse");
        assert!(metadata.bom.is_empty());
        assert!(metadata.buildpacks.is_empty());
        assert!(metadata.slices.is_empty());
    }

    #[test]
    fn missing_file_is_tolerated() {
        let loaded = load_build_metadata_optional(Path::new("/nonexistent/metadata.toml"))
            .expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(parse_build_metadata("slices = [").is_err());
    }

    #[test]
    fn wrong_shape_is_an_error() {
        assert!(parse_build_metadata("slices = \"nope\"").is_err());
        assert!(parse_build_metadata("[[slices]]\npaths = [1, 2]").is_err());
    }
}
