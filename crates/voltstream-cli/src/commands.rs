//! `run`, `clean`, and the operator subcommands.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use voltstream_agent::{Agent, LocalMetricService, LocalSearchService};
use voltstream_ingest_docs::SearchQuery;
use voltstream_pipeline::{QueryRegistry, RunOptions, TransformState};
use voltstream_storage::{AppendOutcome, LandingRecord, Operation};

use crate::config::DeployConfig;
use crate::environment::{agent_spec, open_index, summarize, Environment};
use crate::steps::{StepLog, StepOutcome};

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// run
// ============================================================================

/// One transform cycle followed by a projection refresh.
pub fn run_main(config: &DeployConfig) -> Result<()> {
    let env = Environment::open(config)?;
    let mut log = StepLog::new();

    let transformed = match env.transform(&RunOptions::default()) {
        Ok(report) if !report.failed.is_empty() => StepOutcome::failed(summarize(&report)),
        Ok(report) => StepOutcome::Ok(summarize(&report)),
        Err(e) => StepOutcome::failed(format!("{e:#}")),
    };
    log.record("transform", transformed);

    let refreshed = match env.refresh_projections() {
        Ok(written) => StepOutcome::Ok(format!("{} projections", written.len())),
        Err(e) => StepOutcome::failed(e),
    };
    log.record("dashboard", refreshed);
    log.finish("run main")
}

/// Run every registered query and report PASS/FAIL.
pub fn run_test(config: &DeployConfig) -> Result<()> {
    let env = Environment::open(config)?;
    let registry = QueryRegistry::standard();
    let checks = registry.check_all(&env.projection_input());

    for check in &checks {
        let tag = if check.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        println!(
            "{tag} {:<24} {} rows (min {})",
            check.name, check.rows, check.min_rows
        );
    }
    let failed = checks.iter().filter(|c| !c.passed).count();
    println!("{}/{} queries passed", checks.len() - failed, checks.len());
    if failed > 0 {
        anyhow::bail!("{failed} queries failed");
    }
    Ok(())
}

pub fn run_status(config: &DeployConfig) -> Result<()> {
    let env = Environment::open(config)?;
    println!("{} {}", "environment".bold(), env.layout.root.display());
    if let Ok(manifest) = fs::read_to_string(env.layout.manifest()) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&manifest) {
            println!(
                "  profile {}, deployed {}",
                value["profile"].as_str().unwrap_or("?"),
                value["deployed_at"].as_str().unwrap_or("?")
            );
        }
    }

    let landing = env.landing.stats();
    println!(
        "{} {} records, {} keys, high-water offset {}",
        "landing".bold(),
        landing.records,
        landing.keys,
        landing.high_water
    );
    for (entity, count) in &landing.by_entity {
        println!("  {entity}: {count}");
    }

    let history = env.history.stats();
    println!(
        "{} {} keys, {} rows, {} current, {} retired",
        "history".bold(),
        history.keys,
        history.rows,
        history.current,
        history.retired_keys
    );
    let state = TransformState::load(&env.layout.checkpoint())?;
    println!(
        "  watermark {} (last run {})",
        state.watermark,
        state
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    match env.history.verify_all() {
        Ok(()) => println!("  {}", "history verified".green()),
        Err(breaches) => println!("  {} {} invariant breaches", "!".red().bold(), breaches.len()),
    }

    let index = open_index(config, &env.layout)?;
    let stats = index.stats();
    println!(
        "{} {} documents, {} chunks, {} terms",
        "index".bold(),
        stats.documents,
        stats.chunks,
        stats.terms
    );
    println!(
        "{} {}",
        "agent".bold(),
        if env.layout.agent_spec().exists() {
            "spec deployed"
        } else {
            "spec not deployed (defaults)"
        }
    );
    Ok(())
}

pub fn run_dashboard_url(config: &DeployConfig) -> Result<()> {
    let dir = config.layout().projections();
    if !dir.is_dir() {
        anyhow::bail!(
            "no projections at {} (run `voltstream deploy --only dashboard`)",
            dir.display()
        );
    }
    let absolute = dir
        .canonicalize()
        .with_context(|| format!("resolving {}", dir.display()))?;
    println!("file://{}", absolute.display());
    Ok(())
}

// ============================================================================
// clean
// ============================================================================

/// Remove the environment; asks on `input` unless `force`.
pub fn clean(config: &DeployConfig, force: bool, input: &mut dyn BufRead) -> Result<()> {
    let root = config.layout().root;
    let mut log = StepLog::new();
    if !root.exists() {
        log.record(
            "clean",
            StepOutcome::Info(format!("{} does not exist; nothing to remove", root.display())),
        );
        return log.finish("clean");
    }

    if !force {
        eprint!("Remove {} and everything in it? [y/N] ", root.display());
        io::stderr().flush()?;
        let mut answer = String::new();
        input.read_line(&mut answer)?;
        let confirmed = matches!(answer.trim().to_lowercase().as_str(), "y" | "yes");
        if !confirmed {
            log.record("clean", StepOutcome::Info("aborted; nothing removed".to_string()));
            return log.finish("clean");
        }
    }

    let outcome = match fs::remove_dir_all(&root) {
        Ok(()) => StepOutcome::Ok(format!("removed {}", root.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            StepOutcome::Info(format!("{} already removed", root.display()))
        }
        Err(e) => StepOutcome::failed(format!("removing {}: {e}", root.display())),
    };
    log.record("clean", outcome);
    log.finish("clean")
}

// ============================================================================
// landing
// ============================================================================

pub struct AppendArgs<'a> {
    pub source: &'a str,
    pub entity: &'a str,
    pub key: &'a str,
    pub operation: Operation,
    pub sequence: u64,
    pub payload: Option<&'a str>,
    pub load_time: Option<&'a str>,
}

pub fn landing_append(config: &DeployConfig, args: AppendArgs<'_>) -> Result<()> {
    let env = Environment::open(config)?;
    let payload = match args.payload {
        Some(json) => serde_json::from_str(json).context("payload must be a JSON object")?,
        None => BTreeMap::new(),
    };
    let load_time = match args.load_time {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("load time `{s}` is not RFC 3339"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let record = LandingRecord {
        source: args.source.to_string(),
        entity: args.entity.to_string(),
        natural_key: args.key.to_string(),
        operation: args.operation,
        sequence: args.sequence,
        payload,
        load_time,
    };
    match env.landing.append(record)? {
        AppendOutcome::Accepted { offset } => {
            eprintln!("{} landed at offset {offset}", "ok".green().bold())
        }
        AppendOutcome::Duplicate { offset } => eprintln!(
            "{} duplicate of offset {offset}; nothing written",
            "info".cyan().bold()
        ),
    }
    Ok(())
}

pub fn landing_load(config: &DeployConfig, path: &Path) -> Result<()> {
    let env = Environment::open(config)?;
    let summary = env
        .landing
        .load_jsonl(path)
        .with_context(|| format!("loading {}", path.display()))?;
    eprintln!(
        "{} {} accepted, {} duplicates from {}",
        "ok".green().bold(),
        summary.accepted,
        summary.duplicates,
        path.display()
    );
    Ok(())
}

pub fn landing_stats(config: &DeployConfig) -> Result<()> {
    let env = Environment::open(config)?;
    print_json(&env.landing.stats())
}

// ============================================================================
// transform / project / verify
// ============================================================================

pub fn transform(config: &DeployConfig, max_keys: Option<usize>) -> Result<()> {
    let env = Environment::open(config)?;
    let options = RunOptions {
        max_keys,
        ..Default::default()
    };
    let report = env.transform(&options)?;
    eprintln!("{} {}", "transform".bold(), summarize(&report));
    print_json(&report)?;
    if !report.failed.is_empty() {
        anyhow::bail!("{} keys failed", report.failed.len());
    }
    Ok(())
}

pub fn project(config: &DeployConfig, name: Option<&str>) -> Result<()> {
    let env = Environment::open(config)?;
    match name {
        Some(name) => {
            let projection = QueryRegistry::standard().run(name, &env.projection_input())?;
            print_json(&projection.records())
        }
        None => {
            for path in env.refresh_projections()? {
                eprintln!("{} {}", "wrote".green().bold(), path.display());
            }
            Ok(())
        }
    }
}

pub fn verify(config: &DeployConfig) -> Result<()> {
    let env = Environment::open(config)?;
    let stats = env.history.stats();
    match env.history.verify_all() {
        Ok(()) => {
            eprintln!(
                "{} {} keys, {} rows: history is contiguous",
                "ok".green().bold(),
                stats.keys,
                stats.rows
            );
            Ok(())
        }
        Err(breaches) => {
            for breach in &breaches {
                eprintln!("{} {breach}", "fail".red().bold());
            }
            Err(anyhow!(
                "{} invariant breaches; manual repair required",
                breaches.len()
            ))
        }
    }
}

// ============================================================================
// index / ask
// ============================================================================

pub fn index_load(config: &DeployConfig, dir: &Path) -> Result<()> {
    let layout = config.layout();
    if !layout.exists() {
        anyhow::bail!("environment {} is not deployed", layout.root.display());
    }
    let mut index = open_index(config, &layout)?;
    let summary = index.load_dir(dir)?;
    index.save(&layout.chunks())?;
    eprintln!(
        "{} {} documents, {} chunks ({} replaced)",
        "ok".green().bold(),
        summary.documents,
        summary.chunks,
        summary.replaced
    );
    Ok(())
}

/// `key=value` filter argument.
pub fn parse_filter(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("filter `{raw}` must look like attribute=value"))?;
    if key.is_empty() {
        anyhow::bail!("filter `{raw}` has an empty attribute name");
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn index_search(
    config: &DeployConfig,
    text: &str,
    filters: &[(String, String)],
    limit: Option<usize>,
) -> Result<()> {
    let index = open_index(config, &config.layout())?;
    let query = SearchQuery {
        text: text.to_string(),
        filters: filters.iter().cloned().collect(),
        limit,
    };
    print_json(&index.search(&query))
}

pub fn ask(config: &DeployConfig, question: &str, json: bool) -> Result<()> {
    let env = Environment::open(config)?;
    let metrics = LocalMetricService::compute(&QueryRegistry::standard(), &env.projection_input());
    let search = LocalSearchService::new(open_index(config, &env.layout)?);
    let agent = Agent::new(agent_spec(&env.layout)?, Box::new(metrics), Box::new(search))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let reply = runtime.block_on(agent.ask(question))?;

    if json {
        return print_json(&reply);
    }
    eprintln!("{} {}", "route".bold(), reply.route);
    for sub in &reply.sub_queries {
        let tag = if sub.ok { "ok".green().bold() } else { "fail".red().bold() };
        eprintln!("  {tag} {} \"{}\"", sub.tool, sub.request.text);
    }
    println!("{}", reply.answer);
    Ok(())
}
