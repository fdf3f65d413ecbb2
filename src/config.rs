use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::languages::LanguageSpec;

#[derive(Parser)]
#[command(name = "dcode-runner", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Address to bind, overrides the configuration file
    #[arg(long = "bind")]
    pub bind_address: Option<String>,

    /// Port to bind, overrides the configuration file
    #[arg(long = "port", short = 'p')]
    pub bind_port: Option<u16>,

    /// Number of execution slots, overrides the configuration file
    #[arg(long = "slots", short = 's')]
    pub slots: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file and apply command line overrides
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };

        if let Some(address) = &self.bind_address {
            config.server.bind_address = Some(address.clone());
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = Some(port);
        }
        if let Some(slots) = self.slots {
            config.execution.max_concurrent_slots = slots;
        }

        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub execution: ExecutionConfig,
    pub sandbox: SandboxConfig,
    /// Replaces the built-in language catalog when present
    pub languages: Option<Vec<LanguageSpec>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// Admission and limit settings shared by the scheduler, the quota tracker and the runners
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub max_concurrent_slots: usize,
    pub queue_capacity: usize,
    pub default_wall_clock_ms: MilliSecond,
    pub compile_wall_clock_ms: MilliSecond,
    pub default_cpu_ms: MilliSecond,
    pub default_memory_mb: MegaByte,
    pub default_output_bytes: u64,
    pub result_retention_seconds: u64,
    pub rate_per_minute: u32,
    pub max_in_flight_per_client: u32,
    pub max_source_bytes: usize,
    pub shutdown_grace_ms: MilliSecond,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_slots: 4,
            queue_capacity: 64,
            default_wall_clock_ms: MilliSecond(5_000),
            compile_wall_clock_ms: MilliSecond(15_000),
            default_cpu_ms: MilliSecond(3_000),
            default_memory_mb: MegaByte(256),
            default_output_bytes: 64 * 1024,
            result_retention_seconds: 600,
            rate_per_minute: 30,
            max_in_flight_per_client: 4,
            max_source_bytes: 256 * 1024,
            shutdown_grace_ms: MilliSecond(10_000),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Directory under which single-use workspaces are created
    pub work_root: Option<PathBuf>,
    /// PATH handed to compilers and programs
    pub path_env: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            path_env: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for std::time::Duration {
    fn from(value: MilliSecond) -> Self {
        std::time::Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MegaByte(pub u64);

impl MegaByte {
    pub fn as_bytes(self) -> u64 {
        self.0 * 1024 * 1024
    }
}
