//! Ordered process startup.
//!
//! Components are brought up by an explicit list of named steps. Each step
//! belongs to a [`StartupStage`]; stages run in their declared order and
//! steps within a stage in the order they were added. The router has to be
//! up before anything asks it about ownership, and senders need a recovered
//! outbox, which is what the stage order encodes.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::{error, info};

/// Startup stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StartupStage {
    /// Cluster membership and partition ownership.
    Router,
    /// Outbox recovery.
    Outbox,
    /// Bulk fetchers.
    Fetchers,
    /// Downlink senders.
    Senders,
    /// Periodic collaborator jobs.
    Collaborators,
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartupStage::Router => "router",
            StartupStage::Outbox => "outbox",
            StartupStage::Fetchers => "fetchers",
            StartupStage::Senders => "senders",
            StartupStage::Collaborators => "collaborators",
        };
        f.write_str(name)
    }
}

type StepFuture = Pin<Box<dyn Future<Output = SyncResult<()>> + Send>>;

struct Step {
    stage: StartupStage,
    name: String,
    run: Box<dyn FnOnce() -> StepFuture + Send>,
}

/// Explicit startup sequence, executed once.
#[derive(Default)]
pub struct StartupPlan {
    steps: Vec<Step>,
    started: bool,
}

impl StartupPlan {
    /// Creates an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step.
    pub fn add<F, Fut>(&mut self, stage: StartupStage, name: impl Into<String>, step: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        self.steps.push(Step {
            stage,
            name: name.into(),
            run: Box::new(move || Box::pin(step())),
        });
        self
    }

    /// Step names in the order they will run.
    pub fn order(&self) -> Vec<(StartupStage, String)> {
        let mut order: Vec<(StartupStage, String)> = self
            .steps
            .iter()
            .map(|s| (s.stage, s.name.clone()))
            .collect();
        order.sort_by_key(|(stage, _)| *stage);
        order
    }

    /// Runs every step once.
    ///
    /// Stops at the first failing step; later steps are not run.
    pub async fn run(&mut self) -> SyncResult<Vec<String>> {
        if self.started {
            return Err(SyncError::AlreadyStarted("startup plan"));
        }
        self.started = true;

        let mut steps = std::mem::take(&mut self.steps);
        steps.sort_by_key(|s| s.stage);

        let mut completed = Vec::with_capacity(steps.len());
        for step in steps {
            let started = Instant::now();
            if let Err(e) = (step.run)().await {
                error!(stage = %step.stage, step = %step.name, error = %e, "startup step failed");
                return Err(SyncError::Startup {
                    step: step.name,
                    message: e.to_string(),
                });
            }
            info!(
                stage = %step.stage,
                step = %step.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "startup step done"
            );
            completed.push(step.name);
        }
        Ok(completed)
    }
}
