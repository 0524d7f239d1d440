//! Typed view of the scheduler's YAML configuration document.
//!
//! Loading follows the same shape as `shipper-config`'s `load_config`: a
//! plain `serde` struct, a `Result`-returning loader, defaults filled in
//! with `#[serde(default)]`, and validation performed once up front so
//! later code can assume the document is well-formed.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::errors::SchedulerError;

#[derive(Debug, Clone, Deserialize)]
pub struct RepoArchEntry {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepRepoArchEntry {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuilderConfig {
    pub arch: String,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    pub upload: String,
    #[serde(default)]
    pub patterns: IndexMap<String, String>,
    #[serde(default, rename = "built-architectures")]
    pub built_architectures: Option<Vec<String>>,
    #[serde(default, rename = "dependency-repositories")]
    pub dependency_repositories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub repositories: IndexMap<String, IndexMap<String, RepoArchEntry>>,
    #[serde(default, rename = "dependency-repositories")]
    pub dependency_repositories: IndexMap<String, IndexMap<String, DepRepoArchEntry>>,
    pub builders: IndexMap<String, BuilderConfig>,
    #[serde(default)]
    pub rules: IndexMap<String, RuleConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, SchedulerError> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| SchedulerError::config(format!("can't read {:?}: {}", path.as_ref(), e)))?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Config, SchedulerError> {
        let cfg: Config = serde_yaml::from_str(text)
            .map_err(|e| SchedulerError::config(format!("invalid configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        if self.repositories.is_empty() {
            return Err(SchedulerError::config("no repositories declared"));
        }
        if self.builders.is_empty() {
            return Err(SchedulerError::config("no builders declared"));
        }
        for repo_archs in self.repositories.values() {
            if repo_archs.is_empty() {
                return Err(SchedulerError::config("repository declared with no architectures"));
            }
        }
        for (rule_name, rule) in &self.rules {
            if !self.repositories.contains_key(&rule.upload) {
                return Err(SchedulerError::config(format!(
                    "rule {:?} references unknown upload repository {:?}",
                    rule_name, rule.upload
                )));
            }
        }
        Ok(())
    }

    /// Architectures configured for a given upload repository, in insertion
    /// order. Used as the default `archs` for a rule that doesn't declare
    /// `built-architectures`.
    pub fn archs_for_repo(&self, repo: &str) -> Vec<String> {
        self.repositories
            .get(repo)
            .map(|archs| archs.keys().cloned().collect())
            .unwrap_or_default()
    }
}
