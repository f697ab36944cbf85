use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use launcher::WorkerContext;

use crate::{
    checkpoint::{Checkpointer, FileCheckpointer},
    config::TrainConfig,
    model::Model,
    replica::DistributedModel,
    report::MetricsReport,
};

/// Trained sub-model name to the config that reproduces it. Several names may describe
/// the same sub-model.
pub type TrainedConfigs = BTreeMap<String, TrainConfig>;

/// The collaborator that knows how to build, train and evaluate a model.
///
/// Every method runs on every worker of the job, implementations gate their own side
/// effects on `WorkerContext::is_leader`.
#[async_trait]
pub trait Runner: Send + Sync {
    type Model: Model + 'static;

    fn build_model(&self, cfg: &TrainConfig) -> anyhow::Result<Self::Model>;

    fn build_checkpointer(
        &self,
        _cfg: &TrainConfig,
        ctx: &WorkerContext,
        save_dir: &Path,
    ) -> Box<dyn Checkpointer> {
        Box::new(FileCheckpointer::new(save_dir, ctx.is_leader()))
    }

    /// Trains `model`, entering the same collectives on every worker.
    ///
    /// # Returns
    /// The configs of every trained sub-model.
    async fn do_train(
        &self,
        cfg: &TrainConfig,
        model: &mut DistributedModel<Self::Model>,
        resume: bool,
    ) -> anyhow::Result<TrainedConfigs>;

    /// Evaluates `model`, `train_iter` is the iteration its weights come from if known.
    async fn do_test(
        &self,
        cfg: &TrainConfig,
        model: &mut Self::Model,
        train_iter: Option<u64>,
    ) -> anyhow::Result<MetricsReport>;
}
