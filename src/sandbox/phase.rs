use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::ResourceLimits;
use super::capture::{CapturedStream, capture};
use super::monitor;

/// Memory and CPU time are sampled at this granularity; the reported memory is the peak
const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for pipes to close once the group is dead
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// Static rlimits applied to every child
const OPEN_FILES: u64 = 512;
const FILE_SIZE: u64 = 64 * 1024 * 1024; // bytes

/// One command to run inside a workspace
pub(super) struct Phase<'a> {
    pub(super) argv: &'a [String],
    pub(super) workdir: &'a Path,
    pub(super) env: &'a [(String, String)],
    pub(super) stdin: Option<&'a str>,
    pub(super) limits: &'a ResourceLimits,
    pub(super) cancel: &'a CancellationToken,
}

#[derive(Debug)]
pub(super) enum PhaseEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    OutputLimitExceeded,
    MemoryLimitExceeded,
    /// Killed by the kernel for spending its CPU budget, by SIGXCPU or at the hard limit
    CpuLimitExceeded(ExitStatus),
}

#[derive(Debug)]
pub(super) struct PhaseOutput {
    pub(super) end: PhaseEnd,
    pub(super) stdout: CapturedStream,
    pub(super) stderr: CapturedStream,
    pub(super) wall_time: Duration,
    pub(super) memory_peak_bytes: u64,
}

impl PhaseOutput {
    pub(super) fn succeeded(&self) -> bool {
        matches!(&self.end, PhaseEnd::Exited(status) if status.success())
    }
}

#[derive(Clone, Copy)]
struct Rlimits {
    cpu_seconds: u64,
}

impl Rlimits {
    fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            cpu_seconds: limits.cpu_ms.div_ceil(1000).max(1),
        }
    }

    /// Whether the kernel ended the process for its CPU usage
    ///
    /// SIGXCPU arrives at the soft limit. A process that catches or ignores
    /// it is sent SIGKILL at the hard limit, which is told apart from other
    /// kills by the sampled CPU time having passed the soft limit.
    fn cpu_exhausted(self, status: ExitStatus, cpu_ms: u64) -> bool {
        match status.signal() {
            Some(libc::SIGXCPU) => true,
            Some(libc::SIGKILL) => cpu_ms >= self.cpu_seconds * 1000,
            _ => false,
        }
    }

    /// Runs in the forked child before exec; only async-signal-safe calls allowed
    fn apply(self) -> io::Result<()> {
        let cpu = libc::rlimit {
            rlim_cur: self.cpu_seconds as libc::rlim_t,
            rlim_max: (self.cpu_seconds + 1) as libc::rlim_t,
        };
        let fsize = libc::rlimit {
            rlim_cur: FILE_SIZE as libc::rlim_t,
            rlim_max: FILE_SIZE as libc::rlim_t,
        };
        let nofile = libc::rlimit {
            rlim_cur: OPEN_FILES as libc::rlim_t,
            rlim_max: OPEN_FILES as libc::rlim_t,
        };
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: setrlimit only reads the struct passed by reference
        unsafe {
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0
                || libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0
                || libc::setrlimit(libc::RLIMIT_NOFILE, &nofile) != 0
                || libc::setrlimit(libc::RLIMIT_CORE, &core) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Spawns the command in a fresh process group and supervises it until it
/// exits or a limit is hit. The whole group is always killed before returning.
pub(super) async fn run_phase(phase: Phase<'_>) -> Result<PhaseOutput> {
    let Some((program, args)) = phase.argv.split_first() else {
        bail!("Empty command");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(phase.workdir)
        .env_clear()
        .envs(phase.env.iter().map(|(k, v)| (k, v)))
        .stdin(if phase.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let rlimits = Rlimits::from_limits(phase.limits);
    // SAFETY: the hook only calls setrlimit, which is async-signal-safe
    unsafe {
        cmd.pre_exec(move || rlimits.apply());
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    // process_group(0) makes the child the leader of a group named after its pid
    let pgid = child
        .id()
        .context("Child was reaped before its pid was read")? as i32;
    log::debug!("Spawned {program} as process group {pgid}");

    let stdin_task = match (child.stdin.take(), phase.stdin) {
        (Some(mut pipe), Some(input)) => {
            let input = input.as_bytes().to_vec();
            Some(tokio::spawn(async move {
                // The child may exit without reading its input
                if let Err(e) = pipe.write_all(&input).await {
                    log::debug!("Stopped writing stdin: {e}");
                }
            }))
        }
        _ => None,
    };

    let overflow = CancellationToken::new();
    let stdout_task = tokio::spawn(capture(
        child.stdout.take().context("Child stdout was not piped")?,
        phase.limits.output_bytes,
        overflow.clone(),
    ));
    let stderr_task = tokio::spawn(capture(
        child.stderr.take().context("Child stderr was not piped")?,
        phase.limits.output_bytes,
        overflow.clone(),
    ));

    let deadline = tokio::time::sleep(phase.limits.wall_clock);
    tokio::pin!(deadline);
    let mut sampler = tokio::time::interval(SAMPLE_INTERVAL);
    sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut memory_peak_bytes = 0;
    let mut cpu_peak_ms = 0;

    let end = loop {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => break PhaseEnd::Exited(status),
                Err(e) => {
                    monitor::kill_group(pgid);
                    return Err(e).context("Failed to wait for child");
                }
            },
            _ = &mut deadline => break PhaseEnd::TimedOut,
            _ = phase.cancel.cancelled() => break PhaseEnd::Cancelled,
            _ = overflow.cancelled() => break PhaseEnd::OutputLimitExceeded,
            _ = sampler.tick() => {
                let usage = monitor::group_usage(pgid).unwrap_or_default();
                memory_peak_bytes = memory_peak_bytes.max(usage.rss_bytes);
                cpu_peak_ms = cpu_peak_ms.max(usage.cpu_ms);
                if memory_peak_bytes > phase.limits.memory_bytes {
                    break PhaseEnd::MemoryLimitExceeded;
                }
            }
        }
    };

    match end {
        PhaseEnd::Exited(_) => {
            // The leader is reaped; its pgid stays reserved only while other members remain
            let lingering = monitor::group_usage(pgid).is_none_or(|usage| usage.members > 0);
            if lingering {
                monitor::kill_group(pgid);
            }
        }
        _ => {
            monitor::kill_group(pgid);
            if let Err(e) = child.wait().await {
                log::warn!("Failed to reap process group {pgid} leader: {e}");
            }
        }
    }
    let wall_time = started.elapsed();

    let end = match end {
        PhaseEnd::Exited(status) if rlimits.cpu_exhausted(status, cpu_peak_ms) => {
            PhaseEnd::CpuLimitExceeded(status)
        }
        end => end,
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    let stdout = join_capture(stdout_task).await;
    let stderr = join_capture(stderr_task).await;

    log::debug!("Process group {pgid} finished after {wall_time:?}: {end:?}");

    Ok(PhaseOutput {
        end,
        stdout,
        stderr,
        wall_time,
        memory_peak_bytes,
    })
}

async fn join_capture(mut handle: JoinHandle<CapturedStream>) -> CapturedStream {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            log::error!("Output capture task failed: {e}");
            CapturedStream::default()
        }
        Err(_) => {
            // A process that escaped the group still holds the pipe open
            handle.abort();
            log::warn!("Output pipe still open after the process group was killed");
            CapturedStream::default()
        }
    }
}
