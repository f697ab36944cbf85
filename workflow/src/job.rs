//! Ties the launcher to the workflow: the entry point every worker runs and the
//! function `train_net` calls.

use std::time::Duration;

use launcher::{JobSpec, ProcessGroup, Topology, WorkerContext};
use log::info;

use crate::{
    cli::{Cli, prepare_for_launch},
    config::{TrainConfig, setup_after_launch},
    error::{Result, WorkflowError},
    phases::PhaseController,
    report::{RunResult, aggregate},
    runner::Runner,
    runners::{self, linear::LinearRunner},
};

/// What every worker needs to run its part of the job.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub cfg: TrainConfig,
    pub runner: String,
    pub eval_only: bool,
    pub resume: bool,
}

/// Runs the phases with `runner` and aggregates the outcome.
pub async fn run_job<R: Runner>(
    runner: &R,
    ctx: &WorkerContext,
    group: ProcessGroup,
    args: &WorkerArgs,
) -> Result<RunResult> {
    let output = PhaseController::new(runner, ctx, group.clone())
        .run(&args.cfg, args.eval_only, args.resume)
        .await?;

    info!(
        rank = ctx.global_rank();
        "phases: {}",
        output.trace.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
    );

    aggregate(ctx, &group, &args.cfg.output_dir, output).await
}

/// The entry point of every worker process.
pub async fn main_worker(ctx: WorkerContext, group: ProcessGroup, args: WorkerArgs) -> anyhow::Result<RunResult> {
    setup_after_launch(&args.cfg, &ctx)?;

    let result = match args.runner.as_str() {
        runners::LINEAR => run_job(&LinearRunner::new(ctx.clone()), &ctx, group, &args).await?,
        other => {
            return Err(WorkflowError::Config(format!("unknown runner {other:?}")).into());
        }
    };

    Ok(result)
}

/// Launches the job described by `cli` and returns the leader's result.
pub fn run_with_cmdline_args(cli: Cli) -> Result<RunResult> {
    let (cfg, runner) = prepare_for_launch(&cli)?;
    let topology = Topology::new(cli.num_processes, cli.num_machines, cli.machine_rank)?;

    let device = cfg.model.device;
    let args = WorkerArgs {
        cfg,
        runner,
        eval_only: cli.eval_only,
        resume: cli.resume,
    };

    let spec = JobSpec::new(topology, main_worker, args)
        .with_dist_url(cli.dist_url)
        .with_backend(cli.dist_backend)
        .with_device(device)
        .with_collective_timeout(cli.collective_timeout_secs.map(Duration::from_secs));

    Ok(launcher::launch(spec)?)
}
