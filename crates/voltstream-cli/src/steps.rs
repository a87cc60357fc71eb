//! Step outcomes and the ok/warn/fail log printed to stderr.

use colored::Colorize;
use std::fmt;

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    /// The target cannot be reached; nothing after this may run.
    Connectivity(String),
    /// A required file or resource is absent.
    MissingPrecondition(String),
    Failed(String),
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Connectivity(m) => write!(f, "connectivity: {m}"),
            StepFailure::MissingPrecondition(m) => write!(f, "missing precondition: {m}"),
            StepFailure::Failed(m) => write!(f, "{m}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok(String),
    Warn(String),
    /// Nothing to do (resource already absent, step skipped).
    Info(String),
    Fail(StepFailure),
}

impl StepOutcome {
    pub fn failed(message: impl fmt::Display) -> Self {
        StepOutcome::Fail(StepFailure::Failed(message.to_string()))
    }

    pub fn missing(message: impl Into<String>) -> Self {
        StepOutcome::Fail(StepFailure::MissingPrecondition(message.into()))
    }
}

#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<(String, StepOutcome)>,
    quiet: bool,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record without printing.
    #[cfg(test)]
    pub fn quiet() -> Self {
        Self {
            steps: Vec::new(),
            quiet: true,
        }
    }

    pub fn record(&mut self, name: &str, outcome: StepOutcome) {
        if !self.quiet {
            let (tag, detail) = match &outcome {
                StepOutcome::Ok(m) => ("  ok".green().bold(), m.clone()),
                StepOutcome::Warn(m) => ("warn".yellow().bold(), m.clone()),
                StepOutcome::Info(m) => ("info".cyan().bold(), m.clone()),
                StepOutcome::Fail(f) => ("fail".red().bold(), f.to_string()),
            };
            eprintln!("{tag} {} {detail}", format!("{name:<16}").bold());
        }
        match &outcome {
            StepOutcome::Fail(failure) => tracing::error!(step = name, %failure, "step failed"),
            StepOutcome::Warn(m) => tracing::warn!(step = name, message = %m, "step warning"),
            _ => tracing::info!(step = name, "step finished"),
        }
        self.steps.push((name.to_string(), outcome));
    }

    pub fn steps(&self) -> &[(String, StepOutcome)] {
        &self.steps
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, o)| matches!(o, StepOutcome::Fail(_)))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// `Err` naming every failed step, for a non-zero exit.
    pub fn finish(&self, command: &str) -> anyhow::Result<()> {
        let failed = self.failed_steps();
        if failed.is_empty() {
            return Ok(());
        }
        anyhow::bail!("{command} failed at: {}", failed.join(", "))
    }
}
