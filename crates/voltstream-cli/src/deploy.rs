//! `voltstream deploy`
//!
//! ```text
//! connectivity ─▶ infrastructure ─▶ data ─▶ notebook ─▶ dashboard ─▶ search ─▶ agent
//!  (fatal)          dirs + manifest   feeds   (external)  projections  index     spec
//! ```
//!
//! Connectivity failure stops the run before anything is created. Every
//! other step reports on its own and later steps still run.

use anyhow::Result;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use voltstream_agent::AgentSpec;
use voltstream_pipeline::RunOptions;

use crate::config::{Component, DeployConfig, EnvLayout};
use crate::environment::{open_index, summarize, Environment};
use crate::steps::{StepFailure, StepLog, StepOutcome};

pub fn deploy(config: &DeployConfig) -> Result<()> {
    let layout = config.layout();
    eprintln!(
        "{} {} (profile {}) -> {}",
        "Deploying".green().bold(),
        config.prefix,
        config.profile,
        layout.root.display()
    );

    let mut log = StepLog::new();
    run_steps(config, &layout, &mut log);
    log.finish("deploy")
}

pub(crate) fn run_steps(config: &DeployConfig, layout: &EnvLayout, log: &mut StepLog) {
    let reachable = check_connectivity(&config.target);
    let connected = !matches!(reachable, StepOutcome::Fail(_));
    log.record("connectivity", reachable);
    if !connected {
        return;
    }

    if config.only.selects(Component::Infrastructure) {
        log.record("infrastructure", infrastructure(config, layout));
    }
    if config.only.selects(Component::Data) {
        log.record("data", data(config));
    }
    if config.only.selects(Component::Notebook) {
        log.record(
            "notebook",
            StepOutcome::Warn("no managed notebook runtime; model training stays external".to_string()),
        );
    }
    if config.only.selects(Component::Dashboard) {
        log.record("dashboard", dashboard(config));
    }
    if config.only.selects(Component::Search) {
        log.record("search", search(config, layout));
    }
    if config.only.selects(Component::Agent) {
        log.record("agent", agent(layout));
    }
}

// ============================================================================
// Steps
// ============================================================================

/// The target root must be an existing, writable directory.
fn check_connectivity(target: &Path) -> StepOutcome {
    if !target.is_dir() {
        return StepOutcome::Fail(StepFailure::Connectivity(format!(
            "target {} is not a reachable directory",
            target.display()
        )));
    }
    let probe = target.join(format!(".voltstream-probe-{}", std::process::id()));
    match fs::write(&probe, b"probe").and_then(|_| fs::remove_file(&probe)) {
        Ok(()) => StepOutcome::Ok(format!("target {} is writable", target.display())),
        Err(e) => StepOutcome::Fail(StepFailure::Connectivity(format!(
            "target {} is not writable: {e}",
            target.display()
        ))),
    }
}

fn infrastructure(config: &DeployConfig, layout: &EnvLayout) -> StepOutcome {
    let mut created = 0;
    for dir in EnvLayout::DIRS {
        let path = layout.root.join(dir);
        if path.is_dir() {
            continue;
        }
        if let Err(e) = fs::create_dir_all(&path) {
            return StepOutcome::failed(format!("creating {}: {e}", path.display()));
        }
        created += 1;
    }

    let manifest = serde_json::json!({
        "prefix": config.prefix,
        "profile": config.profile,
        "deployed_at": chrono::Utc::now().to_rfc3339(),
    });
    let written = serde_json::to_vec_pretty(&manifest)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| fs::write(layout.manifest(), bytes).map_err(anyhow::Error::from));
    if let Err(e) = written {
        return StepOutcome::failed(format!("writing manifest: {e}"));
    }

    if created == 0 {
        StepOutcome::Ok("already present".to_string())
    } else {
        StepOutcome::Ok(format!("created {created} directories"))
    }
}

/// `*.jsonl` feeds directly under `dir`, sorted by name.
fn feeds(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        let is_feed = entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl");
        if is_feed {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn data(config: &DeployConfig) -> StepOutcome {
    if config.skip_data {
        return StepOutcome::Info("skipped (--skip-data)".to_string());
    }
    if !config.data_dir.is_dir() {
        return StepOutcome::missing(format!("data dir {} not found", config.data_dir.display()));
    }
    let env = match Environment::open(config) {
        Ok(env) => env,
        Err(e) => return StepOutcome::missing(e.to_string()),
    };

    let paths = match feeds(&config.data_dir) {
        Ok(paths) => paths,
        Err(e) => return StepOutcome::failed(e),
    };
    if paths.is_empty() {
        return StepOutcome::Warn(format!("no *.jsonl feeds in {}", config.data_dir.display()));
    }

    let (mut accepted, mut duplicates) = (0, 0);
    for path in &paths {
        match env.landing.load_jsonl(path) {
            Ok(summary) => {
                accepted += summary.accepted;
                duplicates += summary.duplicates;
            }
            Err(e) => return StepOutcome::failed(format!("{}: {e}", path.display())),
        }
    }

    match env.transform(&RunOptions::default()) {
        Ok(report) if !report.failed.is_empty() => StepOutcome::failed(summarize(&report)),
        Ok(report) => StepOutcome::Ok(format!(
            "{accepted} records landed ({duplicates} duplicates) from {} feeds; {}",
            paths.len(),
            summarize(&report)
        )),
        Err(e) => StepOutcome::failed(format!("transform: {e:#}")),
    }
}

fn dashboard(config: &DeployConfig) -> StepOutcome {
    let env = match Environment::open(config) {
        Ok(env) => env,
        Err(e) => return StepOutcome::missing(e.to_string()),
    };
    match env.refresh_projections() {
        Ok(written) => StepOutcome::Ok(format!(
            "{} projections in {}",
            written.len(),
            env.layout.projections().display()
        )),
        Err(e) => StepOutcome::failed(e),
    }
}

fn search(config: &DeployConfig, layout: &EnvLayout) -> StepOutcome {
    if !layout.exists() {
        return StepOutcome::missing(format!("environment {} is not deployed", layout.root.display()));
    }
    if !config.docs_dir.is_dir() {
        return StepOutcome::missing(format!("docs dir {} not found", config.docs_dir.display()));
    }
    let result = open_index(config, layout).and_then(|mut index| {
        let summary = index.load_dir(&config.docs_dir)?;
        index.save(&layout.chunks())?;
        Ok(summary)
    });
    match result {
        Ok(summary) => StepOutcome::Ok(format!(
            "{} documents, {} chunks ({} replaced)",
            summary.documents, summary.chunks, summary.replaced
        )),
        Err(e) => StepOutcome::failed(format!("{e:#}")),
    }
}

fn agent(layout: &EnvLayout) -> StepOutcome {
    if !layout.exists() {
        return StepOutcome::missing(format!("environment {} is not deployed", layout.root.display()));
    }
    let path = layout.agent_spec();
    if path.exists() {
        return match AgentSpec::load(&path) {
            Ok(spec) => StepOutcome::Ok(format!("kept existing spec `{}`", spec.name)),
            Err(e) => StepOutcome::failed(format!("{}: {e}", path.display())),
        };
    }
    match AgentSpec::default().save(&path) {
        Ok(()) => StepOutcome::Ok(format!("wrote {}", path.display())),
        Err(e) => StepOutcome::failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: &Path) -> DeployConfig {
        DeployConfig {
            target: target.to_path_buf(),
            prefix: "t".to_string(),
            sync_writes: false,
            ..DeployConfig::default()
        }
    }

    #[test]
    fn unreachable_target_stops_before_any_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir.path().join("missing"));
        let mut log = StepLog::quiet();
        run_steps(&config, &config.layout(), &mut log);

        assert_eq!(log.steps().len(), 1);
        assert!(matches!(
            log.steps()[0].1,
            StepOutcome::Fail(StepFailure::Connectivity(_))
        ));
        assert!(!config.layout().root.exists());
    }

    #[test]
    fn only_selector_runs_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.only = Component::Infrastructure;
        let mut log = StepLog::quiet();
        run_steps(&config, &config.layout(), &mut log);

        let names: Vec<&str> = log.steps().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["connectivity", "infrastructure"]);
        for d in EnvLayout::DIRS {
            assert!(config.layout().root.join(d).is_dir());
        }
    }

    #[test]
    fn missing_docs_fail_search_but_not_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.skip_data = true;
        config.docs_dir = dir.path().join("no-docs");
        let mut log = StepLog::quiet();
        run_steps(&config, &config.layout(), &mut log);

        assert_eq!(log.failed_steps(), vec!["search"]);
        assert!(config.layout().agent_spec().exists());
    }
}
