use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::languages::LanguageSpec;
use crate::scheduler::Submission;

use super::{ExecutionLimits, RunOutcome};

/// Per-execution handles passed from the worker into the runner
pub struct RunContext {
    /// Fired on client cancellation or forced shutdown; the runner kills the process group
    pub cancel: CancellationToken,
    on_start: Option<Box<dyn FnOnce() + Send>>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            on_start: None,
        }
    }

    /// Registers a callback invoked when the first child process is about to start
    pub fn on_start(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Signals that a child process is starting. Only the first call has an effect.
    pub fn started(&mut self) {
        if let Some(hook) = self.on_start.take() {
            hook();
        }
    }
}

/// Trait for sandbox execution implementations
///
/// A runner takes one submission through compilation (when the language
/// has a compile step) and execution. Failures of the submitted program
/// are reported through the returned [`RunOutcome`]; `Err` is reserved for
/// failures of the sandbox itself, which the worker records as internal
/// errors.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        submission: &Submission,
        language: &LanguageSpec,
        limits: &ExecutionLimits,
        ctx: &mut RunContext,
    ) -> Result<RunOutcome>;
}
