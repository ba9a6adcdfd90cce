//! Conventional environment variables shared with the other lifecycle
//! phases. The exporter writes the directory variables onto the produced
//! image and reads the ownership variables as defaults for tar headers.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const ENV_LAYERS_DIR: &str = "CNB_LAYERS_DIR";
pub const ENV_APP_DIR: &str = "CNB_APP_DIR";
pub const ENV_USER_ID: &str = "CNB_USER_ID";
pub const ENV_GROUP_ID: &str = "CNB_GROUP_ID";

pub const DEFAULT_LAYERS_DIR: &str = "/layers";
pub const DEFAULT_APP_DIR: &str = "/workspace";

pub fn layers_dir() -> PathBuf {
    PathBuf::from(var_or(ENV_LAYERS_DIR, DEFAULT_LAYERS_DIR))
}

pub fn app_dir() -> PathBuf {
    PathBuf::from(var_or(ENV_APP_DIR, DEFAULT_APP_DIR))
}

pub fn user_id() -> Result<Option<u32>> {
    id_var(ENV_USER_ID)
}

pub fn group_id() -> Result<Option<u32>> {
    id_var(ENV_GROUP_ID)
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn id_var(key: &str) -> Result<Option<u32>> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_defaults_apply_when_unset() {
        env::remove_var(ENV_LAYERS_DIR);
        env::remove_var(ENV_APP_DIR);
        assert_eq!(layers_dir(), PathBuf::from(DEFAULT_LAYERS_DIR));
        assert_eq!(app_dir(), PathBuf::from(DEFAULT_APP_DIR));
    }

    #[test]
    fn ownership_ids_parse_or_reject() {
        env::set_var(ENV_USER_ID, "1000");
        assert_eq!(user_id().expect("parse"), Some(1000));
        env::set_var(ENV_USER_ID, "nope");
        assert!(user_id().is_err());
        env::remove_var(ENV_USER_ID);
        assert_eq!(user_id().expect("unset"), None);
    }
}
