use std::path::PathBuf;

use clap::Parser;
use launcher::{AUTO_DIST_URL, Backend};

use crate::{
    config::TrainConfig,
    error::{Result, WorkflowError},
    runners,
};

/// Launches a distributed train or evaluation job.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(name = "train_net", version)]
pub struct Cli {
    /// A json config file, defaults are used when missing.
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Overrides the config's output directory.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// The runner building, training and testing the model.
    #[arg(long, default_value = "linear")]
    pub runner: String,

    /// Worker processes per machine.
    #[arg(long, default_value_t = 1)]
    pub num_processes: usize,

    #[arg(long, default_value_t = 1)]
    pub num_machines: usize,

    /// The index of this machine.
    #[arg(long, default_value_t = 0)]
    pub machine_rank: usize,

    /// Where the group meets, tcp://host:port or auto on a single machine.
    #[arg(long, default_value = AUTO_DIST_URL)]
    pub dist_url: String,

    #[arg(long, default_value = "tcp")]
    pub dist_backend: Backend,

    /// Only evaluate the configured weights.
    #[arg(long)]
    pub eval_only: bool,

    /// Resume from the output directory's latest checkpoint.
    #[arg(long)]
    pub resume: bool,

    /// Fail any collective that doesn't complete in time, waits forever when missing.
    #[arg(long, value_name = "SECS")]
    pub collective_timeout_secs: Option<u64>,

    /// Config overrides as dotted KEY=VALUE pairs.
    #[arg(value_name = "KEY=VALUE")]
    pub opts: Vec<String>,
}

/// Builds the arguments `train_net` must be invoked with to reproduce `cli`.
pub fn build_cli_args(cli: &Cli) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(path) = &cli.config_file {
        args.push("--config-file".to_string());
        args.push(path.display().to_string());
    }

    if let Some(path) = &cli.output_dir {
        args.push("--output-dir".to_string());
        args.push(path.display().to_string());
    }

    args.extend([
        "--runner".to_string(),
        cli.runner.clone(),
        "--num-processes".to_string(),
        cli.num_processes.to_string(),
        "--num-machines".to_string(),
        cli.num_machines.to_string(),
        "--machine-rank".to_string(),
        cli.machine_rank.to_string(),
        "--dist-url".to_string(),
        cli.dist_url.clone(),
        "--dist-backend".to_string(),
        cli.dist_backend.to_string(),
    ]);

    if cli.eval_only {
        args.push("--eval-only".to_string());
    }

    if cli.resume {
        args.push("--resume".to_string());
    }

    if let Some(secs) = cli.collective_timeout_secs {
        args.push("--collective-timeout-secs".to_string());
        args.push(secs.to_string());
    }

    if !cli.opts.is_empty() {
        args.push("--".to_string());
        args.extend(cli.opts.iter().cloned());
    }

    args
}

/// Resolves everything a job needs before any worker is spawned: the effective config
/// with its output directory, and the runner name.
pub fn prepare_for_launch(cli: &Cli) -> Result<(TrainConfig, String)> {
    let mut cfg = match &cli.config_file {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };

    cfg.merge_overrides(cli.opts.as_slice())?;

    if let Some(dir) = &cli.output_dir {
        cfg.output_dir = dir.clone();
    }

    if !runners::NAMES.contains(&cli.runner.as_str()) {
        return Err(WorkflowError::Config(format!(
            "unknown runner {:?}, available: {}",
            cli.runner,
            runners::NAMES.join(", ")
        )));
    }

    Ok((cfg, cli.runner.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_args_parse_back() {
        let cli = Cli::parse_from([
            "train_net",
            "--output-dir",
            "/tmp/out",
            "--num-processes",
            "2",
            "--dist-url",
            "tcp://127.0.0.1:29500",
            "--eval-only",
            "--collective-timeout-secs",
            "30",
            "model.weights=/tmp/w.json",
            "runner.max_iter=5",
        ]);

        let mut args = vec!["train_net".to_string()];
        args.extend(build_cli_args(&cli));

        assert_eq!(Cli::parse_from(args), cli);
    }

    #[test]
    fn defaults_describe_a_single_local_process() {
        let cli = Cli::parse_from(["train_net"]);

        assert_eq!(cli.num_processes, 1);
        assert_eq!(cli.num_machines, 1);
        assert_eq!(cli.dist_url, AUTO_DIST_URL);
        assert_eq!(cli.dist_backend, Backend::Tcp);
        assert!(!cli.eval_only && !cli.resume);
    }

    #[test]
    fn preparation_applies_overrides_and_output_dir() {
        let cli = Cli::parse_from(["train_net", "--output-dir", "/tmp/run", "seed=11"]);
        let (cfg, runner) = prepare_for_launch(&cli).unwrap();

        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/run"));
        assert_eq!(cfg.seed, Some(11));
        assert_eq!(runner, "linear");

        let cli = Cli::parse_from(["train_net", "--runner", "missing"]);
        assert!(matches!(prepare_for_launch(&cli), Err(WorkflowError::Config(_))));
    }

    #[test]
    fn unknown_backends_are_rejected() {
        assert!(Cli::try_parse_from(["train_net", "--dist-backend", "nccl"]).is_err());
    }
}
