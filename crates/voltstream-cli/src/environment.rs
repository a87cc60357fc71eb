//! Opening a deployed environment and the operations shared by commands.

use anyhow::{Context, Result};
use std::path::PathBuf;

use voltstream_agent::AgentSpec;
use voltstream_ingest_docs::KnowledgeIndex;
use voltstream_pipeline::{
    ProjectionInput, QueryRegistry, RunOptions, SystemClock, TransformReport, TransformState,
    Transformer,
};
use voltstream_storage::{open_stores, HistoryStore, LandingStore};

use crate::config::{DeployConfig, EnvLayout};

/// A deployed environment with both stores open.
pub struct Environment<'c> {
    pub config: &'c DeployConfig,
    pub layout: EnvLayout,
    pub landing: LandingStore,
    pub history: HistoryStore,
}

impl<'c> Environment<'c> {
    /// Fails when the environment has not been deployed.
    pub fn open(config: &'c DeployConfig) -> Result<Self> {
        let layout = config.layout();
        if !layout.exists() {
            anyhow::bail!(
                "environment {} is not deployed (run `voltstream deploy --only infrastructure`)",
                layout.root.display()
            );
        }
        let (landing, history) = open_stores(&layout.storage(config.sync_writes))
            .with_context(|| format!("opening stores under {}", layout.root.display()))?;
        Ok(Self {
            config,
            layout,
            landing,
            history,
        })
    }

    pub fn projection_input(&self) -> ProjectionInput<'_> {
        ProjectionInput::new(&self.landing, &self.history, &self.config.pipeline)
    }

    /// One transform run from the saved checkpoint; the checkpoint is
    /// saved afterwards.
    pub fn transform(&self, options: &RunOptions) -> Result<TransformReport> {
        let checkpoint = self.layout.checkpoint();
        let mut state = TransformState::load(&checkpoint)?;
        let transformer = Transformer::new(
            &self.landing,
            &self.history,
            &self.config.pipeline,
            &SystemClock,
        );
        let report = transformer.run(&mut state, options)?;
        state.save(&checkpoint)?;
        Ok(report)
    }

    pub fn refresh_projections(&self) -> Result<Vec<PathBuf>> {
        let written = QueryRegistry::standard()
            .refresh(&self.projection_input(), &self.layout.projections())?;
        Ok(written)
    }
}

/// The saved index, or an empty one before the first `index load`.
pub fn open_index(config: &DeployConfig, layout: &EnvLayout) -> Result<KnowledgeIndex> {
    let path = layout.chunks();
    if path.exists() {
        return KnowledgeIndex::open(&path, config.index.clone())
            .with_context(|| format!("opening knowledge index {}", path.display()));
    }
    Ok(KnowledgeIndex::new(config.index.clone())?)
}

/// The deployed agent spec, or the default one.
pub fn agent_spec(layout: &EnvLayout) -> Result<AgentSpec> {
    let path = layout.agent_spec();
    if path.exists() {
        return AgentSpec::load(&path).with_context(|| format!("loading {}", path.display()));
    }
    Ok(AgentSpec::default())
}

pub fn summarize(report: &TransformReport) -> String {
    format!(
        "{} keys: {} inserted, {} updated, {} retired, {} unchanged, {} stale, {} failed{}",
        report.keys_seen,
        report.inserted,
        report.updated,
        report.retired,
        report.unchanged,
        report.stale_skipped,
        report.failed.len(),
        if report.watermark_advanced {
            format!(" (watermark {})", report.watermark)
        } else {
            " (watermark held)".to_string()
        }
    )
}
