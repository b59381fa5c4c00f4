//! CLI flag definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use oya_pprof::{Config, SamplerFormat};

/// oya-pprof - profile a synthetic workload
#[derive(Parser, Debug)]
#[command(name = "oya-pprof")]
#[command(version)]
#[command(about = "Run a synthetic workload under a profiling session")]
#[command(
    long_about = "Starts a profiling session in the chosen mode, runs a built-in workload with contended locks, allocations, blocking waits, spawned threads and trace events, then writes one artifact and prints its path."
)]
pub struct Cli {
    /// Profiling mode (cpu, trace, heap, allocs, mutex, block, thread_create, goroutine, sampling_profiler)
    #[arg(long, env = "OYA_PROFILE_MODE")]
    pub profile_mode: Option<String>,

    /// Run the workload without profiling
    #[arg(long, env = "OYA_PROFILE_DISABLE", default_value_t = false)]
    pub profile_disable: bool,

    /// Directory the artifact is written to
    #[arg(short, long, env = "OYA_PROFILE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Prefix prepended to the artifact file name
    #[arg(long)]
    pub file_prefix: Option<String>,

    /// Write snapshot profiles as text instead of pprof
    #[arg(long, default_value_t = false)]
    pub text_format: bool,

    /// Sample one in N contended mutex acquisitions
    #[arg(long)]
    pub mutex_profile_fraction: Option<u32>,

    /// Nanoseconds of blocking per sampled block event
    #[arg(long)]
    pub block_profile_rate: Option<u64>,

    /// Output of the sampling profiler (binary or folded)
    #[arg(long)]
    pub sampler_format: Option<SamplerFormat>,

    /// TOML file with a base configuration; flags override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// How long to run the workload; 0 runs until Ctrl+C
    #[arg(short, long, default_value_t = 1000)]
    pub duration_ms: u64,

    /// Worker threads in the workload
    #[arg(short, long, default_value_t = 4)]
    pub workers: usize,
}

impl Cli {
    /// Build the session configuration from the config file and flags.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Config::from_toml_str(&source)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(mode) = &self.profile_mode {
            config = config.with_mode(mode.as_str());
        }
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir);
        }
        if let Some(prefix) = &self.file_prefix {
            config = config.with_file_prefix(prefix.as_str());
        }
        if let Some(fraction) = self.mutex_profile_fraction {
            config = config.with_mutex_profile_fraction(fraction);
        }
        if let Some(rate) = self.block_profile_rate {
            config = config.with_block_profile_rate(rate);
        }
        if let Some(format) = self.sampler_format {
            config = config.with_sampling_profiler_format(format);
        }
        if self.text_format {
            config = config.with_text_format(true);
        }
        if self.profile_disable {
            config = config.disabled(true);
        }

        Ok(config)
    }
}
