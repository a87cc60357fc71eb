//! Deployment configuration: flags > JSON config file > defaults.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use voltstream_ingest_docs::IndexConfig;
use voltstream_pipeline::PipelineConfig;
use voltstream_storage::StorageConfig;

/// Which deploy steps to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    #[default]
    All,
    Infrastructure,
    Data,
    Notebook,
    Dashboard,
    Search,
    Agent,
}

impl Component {
    pub fn selects(self, step: Component) -> bool {
        self == Component::All || self == step
    }
}

/// Environment flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct EnvArgs {
    /// Environment prefix; namespaces every resource under the target
    #[arg(long, global = true, env = "VOLTSTREAM_PREFIX")]
    pub prefix: Option<String>,
    /// Target root directory (the "platform")
    #[arg(long, global = true, env = "VOLTSTREAM_TARGET")]
    pub target: Option<PathBuf>,
    /// Credential / endpoint profile name
    #[arg(long, global = true, env = "VOLTSTREAM_PROFILE")]
    pub profile: Option<String>,
    /// JSON config file (overridden by flags)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub prefix: String,
    pub target: PathBuf,
    pub profile: String,
    pub skip_data: bool,
    pub only: Component,
    /// `*.jsonl` landing feeds
    pub data_dir: PathBuf,
    /// `.md` / `.txt` documents for the knowledge index
    pub docs_dir: PathBuf,
    pub force: bool,
    pub sync_writes: bool,
    pub pipeline: PipelineConfig,
    pub index: IndexConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            prefix: "voltstream".to_string(),
            target: PathBuf::from("./voltstream-env"),
            profile: "default".to_string(),
            skip_data: false,
            only: Component::All,
            data_dir: PathBuf::from("./demo/data"),
            docs_dir: PathBuf::from("./demo/docs"),
            force: false,
            sync_writes: true,
            pipeline: PipelineConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl DeployConfig {
    /// Defaults, then the config file (if any), then flags.
    pub fn resolve(args: &EnvArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(prefix) = &args.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(target) = &args.target {
            config.target = target.clone();
        }
        if let Some(profile) = &args.profile {
            config.profile = profile.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let valid = !self.prefix.is_empty()
            && self
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            anyhow::bail!(
                "invalid prefix `{}`: use letters, digits, `_` or `-`",
                self.prefix
            );
        }
        Ok(())
    }

    pub fn layout(&self) -> EnvLayout {
        EnvLayout::new(self.target.join(&self.prefix))
    }
}

/// Where each resource of one environment lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLayout {
    pub root: PathBuf,
}

impl EnvLayout {
    pub const DIRS: [&'static str; 5] = ["landing", "history", "index", "projections", "agent"];

    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn storage(&self, sync_writes: bool) -> StorageConfig {
        StorageConfig {
            sync_writes,
            ..StorageConfig::under(&self.root)
        }
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.root.join("history").join("transform_state.json")
    }

    pub fn chunks(&self) -> PathBuf {
        self.root.join("index").join("chunks.json")
    }

    pub fn projections(&self) -> PathBuf {
        self.root.join("projections")
    }

    pub fn agent_spec(&self) -> PathBuf {
        self.root.join("agent").join("agent_spec.json")
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("environment.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_which_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.json");
        fs::write(
            &path,
            r#"{"prefix": "from_file", "profile": "staging", "only": "search"}"#,
        )
        .unwrap();

        let args = EnvArgs {
            prefix: Some("from_flag".to_string()),
            config: Some(path),
            ..Default::default()
        };
        let config = DeployConfig::resolve(&args).unwrap();
        assert_eq!(config.prefix, "from_flag");
        assert_eq!(config.profile, "staging");
        assert_eq!(config.only, Component::Search);
        assert_eq!(config.target, PathBuf::from("./voltstream-env"));
    }

    #[test]
    fn rejects_prefix_with_path_separators() {
        let args = EnvArgs {
            prefix: Some("../escape".to_string()),
            ..Default::default()
        };
        assert!(DeployConfig::resolve(&args).is_err());
    }

    #[test]
    fn component_selection() {
        assert!(Component::All.selects(Component::Data));
        assert!(Component::Data.selects(Component::Data));
        assert!(!Component::Search.selects(Component::Data));
    }
}
