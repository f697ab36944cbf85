//! A small self contained runner fitting a linear regression on synthetic data, enough to
//! run `train_net` end to end.

use std::fmt;

use anyhow::{Context, bail};
use async_trait::async_trait;
use launcher::WorkerContext;
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

use crate::{
    checkpoint::AuxiliaryState,
    config::TrainConfig,
    model::{Model, Parameter},
    replica::DistributedModel,
    report::MetricsReport,
    runner::{Runner, TrainedConfigs},
};

const EMA: &str = "ema";
const FINAL_CHECKPOINT: &str = "model_final";
const TEST_SEED_OFFSET: u64 = 0x5eed;

/// The runner's section of the config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinearSettings {
    pub features: usize,
    pub train_samples: usize,
    pub test_samples: usize,
    pub max_iter: u64,
    /// Samples per rank and iteration.
    pub batch_size: usize,
    pub lr: f32,
    /// Iterations between checkpoints, 0 only writes the final one.
    pub checkpoint_period: u64,
    pub ema_decay: f32,
    pub noise: f32,
    /// Makes the given rank fail, at `fail_at_iter` or right away.
    pub fail_on_rank: Option<usize>,
    pub fail_at_iter: Option<u64>,
}

impl Default for LinearSettings {
    fn default() -> Self {
        Self {
            features: 4,
            train_samples: 256,
            test_samples: 64,
            max_iter: 100,
            batch_size: 8,
            lr: 0.1,
            checkpoint_period: 25,
            ema_decay: 0.9,
            noise: 0.01,
            fail_on_rank: None,
            fail_at_iter: None,
        }
    }
}

impl LinearSettings {
    pub fn from_config(cfg: &TrainConfig) -> anyhow::Result<Self> {
        if cfg.runner.is_null() {
            return Ok(Self::default());
        }

        serde_json::from_value(cfg.runner.clone()).context("invalid linear runner settings")
    }
}

struct Sample {
    x: Vec<f32>,
    y: f32,
}

/// Draws `n` noisy samples of a fixed linear function, identical for a given seed.
fn synthesize(features: usize, n: usize, seed: u64, noise: f32) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let truth: Vec<f32> = (0..features)
        .map(|i| {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            sign * 0.5 * (i + 1) as f32
        })
        .collect();

    (0..n)
        .map(|_| {
            let x: Vec<f32> = (0..features).map(|_| rng.random_range(-1.0..1.0)).collect();
            let clean: f32 = truth.iter().zip(&x).map(|(w, x)| w * x).sum::<f32>() + 0.25;
            let y = clean + noise * rng.random_range(-1.0..=1.0);
            Sample { x, y }
        })
        .collect()
}

fn ema_state(ema: &[f32]) -> anyhow::Result<AuxiliaryState> {
    Ok(AuxiliaryState::from([(EMA.to_string(), serde_json::to_value(ema)?)]))
}

/// `y = weight · x + bias`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    params: Vec<Parameter>,
    training: bool,
}

impl LinearModel {
    pub fn new(features: usize) -> Self {
        Self {
            params: vec![
                Parameter::new("weight", vec![0.0; features]),
                Parameter::new("bias", vec![0.0]),
            ],
            training: true,
        }
    }

    pub fn predict(&self, x: &[f32]) -> f32 {
        let [weight, bias] = self.params.as_slice() else {
            return 0.0;
        };

        weight.value.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + bias.value[0]
    }

    /// Sets the mean squared error gradients of `batch`, returns its loss.
    fn backward(&mut self, batch: &[&Sample]) -> f32 {
        let features = self.params[0].len();
        let mut grad_w = vec![0.0; features];
        let mut grad_b = 0.0;
        let mut loss = 0.0;

        for sample in batch {
            let err = self.predict(&sample.x) - sample.y;
            loss += err * err;
            grad_w
                .iter_mut()
                .zip(&sample.x)
                .for_each(|(g, x)| *g += 2.0 * err * x);
            grad_b += 2.0 * err;
        }

        let n = batch.len().max(1) as f32;
        grad_w.iter_mut().for_each(|g| *g /= n);
        self.params[0].grad = Some(grad_w);
        self.params[1].grad = Some(vec![grad_b / n]);

        loss / n
    }

    fn step(&mut self, lr: f32) {
        for p in self.params.iter_mut() {
            if let Some(grad) = p.grad.take() {
                p.value.iter_mut().zip(grad).for_each(|(v, g)| *v -= lr * g);
            }
        }
    }

    fn flat(&self) -> Vec<f32> {
        self.params.iter().flat_map(|p| p.value.iter().copied()).collect()
    }
}

impl fmt::Display for LinearModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LinearModel(features={}, training={})",
            self.params[0].len(),
            self.training
        )
    }
}

impl Model for LinearModel {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

pub struct LinearRunner {
    ctx: WorkerContext,
}

impl LinearRunner {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Runner for LinearRunner {
    type Model = LinearModel;

    fn build_model(&self, cfg: &TrainConfig) -> anyhow::Result<LinearModel> {
        let settings = LinearSettings::from_config(cfg)?;
        if settings.features == 0 {
            bail!("the linear model needs at least one feature");
        }

        Ok(LinearModel::new(settings.features))
    }

    async fn do_train(
        &self,
        cfg: &TrainConfig,
        model: &mut DistributedModel<LinearModel>,
        resume: bool,
    ) -> anyhow::Result<TrainedConfigs> {
        let settings = LinearSettings::from_config(cfg)?;
        let (rank, world_size) = (self.ctx.global_rank(), self.ctx.world_size());

        let checkpointer = self.build_checkpointer(cfg, &self.ctx, &cfg.output_dir);
        let record = checkpointer.resume_or_load(model.module_mut(), &cfg.model.weights, resume)?;
        model.broadcast_parameters().await?;

        let data = synthesize(
            settings.features,
            settings.train_samples,
            cfg.seed.unwrap_or_default(),
            settings.noise,
        );
        let shard: Vec<&Sample> = data
            .iter()
            .enumerate()
            .filter(|(i, _)| i % world_size == rank)
            .map(|(_, sample)| sample)
            .collect();

        if shard.is_empty() {
            bail!("rank {rank} got no training samples, train_samples must be at least {world_size}");
        }

        let mut ema = match record.auxiliary_state.get(EMA) {
            Some(value) => serde_json::from_value(value.clone()).context("invalid ema state")?,
            None => model.flat(),
        };

        let start = record.iteration.map_or(0, |iter| iter + 1);
        if start > 0 {
            info!(rank = rank; "resuming training at iteration {start}");
        }

        let batch_size = settings.batch_size.max(1);
        let mut last = record.iteration;

        for iter in start..settings.max_iter {
            if settings.fail_on_rank == Some(rank)
                && settings.fail_at_iter.is_none_or(|at| at == iter)
            {
                bail!("injected failure on rank {rank} at iteration {iter}");
            }

            let offset = iter as usize * batch_size;
            let batch: Vec<&Sample> = (0..batch_size)
                .map(|k| shard[(offset + k) % shard.len()])
                .collect();

            model.before_forward().await?;
            let loss = model.module_mut().backward(&batch);
            model.synchronize().await?;
            model.module_mut().step(settings.lr);

            let decay = settings.ema_decay;
            ema.iter_mut()
                .zip(model.flat())
                .for_each(|(e, v)| *e = decay * *e + (1.0 - decay) * v);
            last = Some(iter);

            let period = settings.checkpoint_period;
            if period > 0 && (iter + 1) % period == 0 {
                debug!(rank = rank, iter = iter; "loss {loss:.6}");

                if iter + 1 < settings.max_iter {
                    let name = format!("model_{iter:07}");
                    checkpointer.save(&name, model.module(), Some(iter), ema_state(&ema)?)?;
                }
            }
        }

        checkpointer.save(FINAL_CHECKPOINT, model.module(), last, ema_state(&ema)?)?;
        model.group().barrier().await?;

        let mut trained = cfg.clone();
        trained.model.weights = checkpointer
            .checkpoint_path(FINAL_CHECKPOINT)
            .display()
            .to_string();

        Ok(TrainedConfigs::from([(FINAL_CHECKPOINT.to_string(), trained)]))
    }

    async fn do_test(
        &self,
        cfg: &TrainConfig,
        model: &mut LinearModel,
        train_iter: Option<u64>,
    ) -> anyhow::Result<MetricsReport> {
        let settings = LinearSettings::from_config(cfg)?;
        let data = synthesize(
            settings.features,
            settings.test_samples.max(1),
            cfg.seed.unwrap_or_default().wrapping_add(TEST_SEED_OFFSET),
            settings.noise,
        );

        let (mut squared, mut absolute) = (0.0f64, 0.0f64);
        for sample in &data {
            let err = f64::from(model.predict(&sample.x) - sample.y);
            squared += err * err;
            absolute += err.abs();
        }

        let n = data.len() as f64;
        info!(rank = self.ctx.global_rank(); "evaluated weights from iteration {train_iter:?}");

        Ok(MetricsReport::from([
            ("mse".to_string(), squared / n),
            ("mae".to_string(), absolute / n),
        ]))
    }
}
