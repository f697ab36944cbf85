use std::fmt;

use launcher::{DeviceAssignment, ProcessGroup, WorkerContext};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    config::TrainConfig,
    error::{Result, WorkflowError},
    model::Model,
    replica::{DistributedModel, ReplicaOptions},
    report::MetricsReport,
    runner::{Runner, TrainedConfigs},
};

/// The states a worker goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    EvalOnly,
    Train,
    Test,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::EvalOnly => "EVAL_ONLY",
            Phase::Train => "TRAIN",
            Phase::Test => "TEST",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// What a worker produced once it reached `Done`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub metrics: MetricsReport,
    /// Empty unless the worker trained.
    pub trained: TrainedConfigs,
    /// Every phase entered, in order.
    pub trace: Vec<Phase>,
}

/// Drives one worker through either evaluation or training followed by a test.
pub struct PhaseController<'a, R> {
    runner: &'a R,
    ctx: &'a WorkerContext,
    group: ProcessGroup,
    trace: Vec<Phase>,
}

impl<'a, R: Runner> PhaseController<'a, R> {
    pub fn new(runner: &'a R, ctx: &'a WorkerContext, group: ProcessGroup) -> Self {
        Self {
            runner,
            ctx,
            group,
            trace: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(rank = self.ctx.global_rank(); "entering {phase}");
        self.trace.push(phase);
    }

    /// Runs every phase to completion.
    ///
    /// # Arguments
    /// * `cfg` - The job's configuration, checkpoints live in its output directory.
    /// * `eval_only` - Evaluate the configured weights instead of training.
    /// * `resume` - Continue from the output directory's latest checkpoint if there's one.
    pub async fn run(mut self, cfg: &TrainConfig, eval_only: bool, resume: bool) -> Result<PhaseOutput> {
        self.enter(Phase::Init);
        let mut model = self
            .runner
            .build_model(cfg)
            .map_err(WorkflowError::Runner)?;
        info!(rank = self.ctx.global_rank(); "model:\n{model}");

        let (metrics, trained) = if eval_only {
            (self.eval_only(cfg, &mut model, resume).await?, TrainedConfigs::new())
        } else {
            self.train_then_test(cfg, model, resume).await?
        };

        self.enter(Phase::Done);
        Ok(PhaseOutput {
            metrics,
            trained,
            trace: self.trace,
        })
    }

    async fn eval_only(&mut self, cfg: &TrainConfig, model: &mut R::Model, resume: bool) -> Result<MetricsReport> {
        self.enter(Phase::EvalOnly);

        let checkpointer = self
            .runner
            .build_checkpointer(cfg, self.ctx, &cfg.output_dir);

        let record = if resume && checkpointer.has_checkpoint() {
            checkpointer.resume_or_load(model, &cfg.model.weights, resume)?
        } else {
            checkpointer.load(model, &cfg.model.weights)?
        };

        model.set_training(false);
        self.runner
            .do_test(cfg, model, record.iteration)
            .await
            .map_err(WorkflowError::Runner)
    }

    async fn train_then_test(
        &mut self,
        cfg: &TrainConfig,
        mut model: R::Model,
        resume: bool,
    ) -> Result<(MetricsReport, TrainedConfigs)> {
        self.enter(Phase::Train);

        let device_ids = match self.ctx.device() {
            DeviceAssignment::Cpu => None,
            DeviceAssignment::Accelerator(ordinal) => Some(vec![ordinal]),
        };

        let options = ReplicaOptions {
            gradient_compression: cfg.model.ddp_fp16_grad_compress,
            device_ids,
            broadcast_buffers: false,
            find_unused_parameters: cfg.model.ddp_find_unused_parameters,
        };

        model.set_training(true);
        let mut replica =
            DistributedModel::wrap(model, self.ctx.clone(), self.group.clone(), options).await?;

        let trained = self
            .runner
            .do_train(cfg, &mut replica, resume)
            .await
            .map_err(WorkflowError::Runner)?;

        self.enter(Phase::Test);
        let mut model = replica.into_inner();
        model.set_training(false);

        let metrics = self
            .runner
            .do_test(cfg, &mut model, None)
            .await
            .map_err(WorkflowError::Runner)?;

        Ok((metrics, trained))
    }
}
