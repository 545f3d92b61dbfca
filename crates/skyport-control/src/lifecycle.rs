//! Phased execution: Init, Run, Cleanup.
//!
//! Deploying an application and installing the control plane are both
//! expressed as a [`Lifecycle`]. Only `run` is mandatory. The first failing
//! phase stops execution and the error names the phase. Cleanup runs only
//! after a successful run.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};

/// A lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Prepare the environment.
    Init,
    /// Do the work.
    Run,
    /// Tidy up after a successful run.
    Cleanup,
}

impl Phase {
    /// Get the phase name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Run => "run",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives progress from a running lifecycle.
pub trait StepReporter: Send + Sync {
    /// A step started or finished.
    fn step(&self, phase: Phase, message: &str);

    /// Something went wrong but the phase continues.
    fn warn(&self, phase: Phase, message: &str) {
        self.step(phase, message);
    }
}

/// Reports steps through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    lifecycle: String,
}

impl TracingReporter {
    /// Create a reporter for the named lifecycle.
    #[must_use]
    pub fn new(lifecycle: impl Into<String>) -> Self {
        Self {
            lifecycle: lifecycle.into(),
        }
    }
}

impl StepReporter for TracingReporter {
    fn step(&self, phase: Phase, message: &str) {
        info!(lifecycle = %self.lifecycle, phase = %phase, "{message}");
    }

    fn warn(&self, phase: Phase, message: &str) {
        warn!(lifecycle = %self.lifecycle, phase = %phase, "{message}");
    }
}

/// A unit of work run in phases.
#[async_trait]
pub trait Lifecycle: Send {
    /// What a successful run produces.
    type Output: Send + Sync;

    /// Name used in errors and logs.
    fn name(&self) -> String;

    /// Prepare the environment.
    async fn init(&mut self, _reporter: &dyn StepReporter) -> ControlResult<()> {
        Ok(())
    }

    /// Do the work.
    async fn run(&mut self, reporter: &dyn StepReporter) -> ControlResult<Self::Output>;

    /// Tidy up after a successful run.
    async fn cleanup(
        &mut self,
        _output: &Self::Output,
        _reporter: &dyn StepReporter,
    ) -> ControlResult<()> {
        Ok(())
    }
}

fn phase_error(lifecycle: String, phase: Phase, source: ControlError) -> ControlError {
    ControlError::Phase {
        lifecycle,
        phase: phase.as_str(),
        source: Box::new(source),
    }
}

/// Run a lifecycle through its phases.
pub async fn execute<L>(lifecycle: &mut L, reporter: &dyn StepReporter) -> ControlResult<L::Output>
where
    L: Lifecycle + ?Sized,
{
    reporter.step(Phase::Init, "starting");
    lifecycle
        .init(reporter)
        .await
        .map_err(|e| phase_error(lifecycle.name(), Phase::Init, e))?;

    reporter.step(Phase::Run, "starting");
    let output = lifecycle
        .run(reporter)
        .await
        .map_err(|e| phase_error(lifecycle.name(), Phase::Run, e))?;

    reporter.step(Phase::Cleanup, "starting");
    lifecycle
        .cleanup(&output, reporter)
        .await
        .map_err(|e| phase_error(lifecycle.name(), Phase::Cleanup, e))?;

    reporter.step(Phase::Cleanup, "finished");
    Ok(output)
}
