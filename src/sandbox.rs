mod capture;
mod monitor;
mod phase;
mod process_runner;
mod runner;
mod workspace;

pub use process_runner::ProcessRunner;
pub use runner::{RunContext, SandboxRunner};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{ExecutionConfig, MegaByte, SandboxConfig};
use crate::error::FailureKind;
use crate::languages::LanguageSpec;
use crate::results::ExecutionStatus;

/// Compilers get at least this much memory regardless of the language's run limit
const COMPILE_MEMORY_FLOOR_MB: u64 = 1024;

/// Limits enforced on one phase of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub wall_clock: Duration,
    pub cpu_ms: u64,
    pub memory_bytes: u64,
    pub output_bytes: u64,
}

impl ResourceLimits {
    /// Limits for the run phase: the language's own defaults, else the service-wide ones
    pub fn for_run(language: &LanguageSpec, execution: &ExecutionConfig) -> Self {
        let memory = language
            .default_memory_limit_mb
            .map(MegaByte)
            .unwrap_or(execution.default_memory_mb);
        Self {
            wall_clock: execution.default_wall_clock_ms.into(),
            cpu_ms: language
                .default_cpu_limit_ms
                .unwrap_or(execution.default_cpu_ms.0),
            memory_bytes: memory.as_bytes(),
            output_bytes: language
                .default_output_limit_bytes
                .unwrap_or(execution.default_output_bytes),
        }
    }

    /// Limits for the compile phase
    pub fn for_compile(language: &LanguageSpec, execution: &ExecutionConfig) -> Self {
        let run = Self::for_run(language, execution);
        let wall_clock: Duration = execution.compile_wall_clock_ms.into();
        Self {
            wall_clock,
            cpu_ms: wall_clock.as_millis() as u64,
            memory_bytes: run.memory_bytes.max(COMPILE_MEMORY_FLOOR_MB * 1024 * 1024),
            output_bytes: run.output_bytes,
        }
    }
}

/// Limits for both phases of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub compile: ResourceLimits,
    pub run: ResourceLimits,
}

impl ExecutionLimits {
    pub fn resolve(language: &LanguageSpec, execution: &ExecutionConfig) -> Self {
        Self {
            compile: ResourceLimits::for_compile(language, execution),
            run: ResourceLimits::for_run(language, execution),
        }
    }
}

/// Terminal outcome of one submission as produced by a runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub failure: Option<FailureKind>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time_ms: u64,
    pub memory_peak_mb: u64,
    pub truncated: bool,
}

impl RunOutcome {
    /// A failure of the service itself rather than of the submitted program
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            failure: Some(FailureKind::InternalError),
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            signal: None,
            wall_time_ms: 0,
            memory_peak_mb: 0,
            truncated: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            failure: None,
            ..Self::internal_error(String::new())
        }
    }
}

/// Creates the runner used by every worker
///
/// Child processes always get their own process group, rlimits and a
/// throwaway workspace. Peak memory is sampled from `/proc`, so on
/// platforms without it memory limits are not enforced.
pub fn create_sandbox_runner(config: &SandboxConfig) -> Result<Arc<dyn SandboxRunner>> {
    let runner = ProcessRunner::build(config)?;
    if !std::path::Path::new("/proc/self/stat").exists() {
        log::warn!("/proc is unavailable, memory limits will not be enforced");
    }
    Ok(Arc::new(runner))
}
