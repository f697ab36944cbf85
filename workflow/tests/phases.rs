use std::{
    fmt,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use launcher::{
    Backend, DeviceKind, GroupOptions, ProcessGroup, RendezvousAddr, Topology, WorkerContext,
};
use serde_json::json;
use tokio::task::JoinSet;
use workflow::{
    Checkpointer, DistributedModel, FileCheckpointer, MetricsReport, Model, Parameter, Phase,
    PhaseController, Runner, TrainConfig, TrainedConfigs, WorkflowError,
    checkpoint::AuxiliaryState,
    job::{self, WorkerArgs},
    runners::linear::LinearRunner,
};

struct Probe(Vec<Parameter>);

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Probe")
    }
}

impl Model for Probe {
    fn parameters(&self) -> &[Parameter] {
        &self.0
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.0
    }

    fn set_training(&mut self, _: bool) {}

    fn is_training(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct Counting {
    trains: AtomicUsize,
    tests: AtomicUsize,
    test_iters: Mutex<Vec<Option<u64>>>,
    fail_train: bool,
}

#[async_trait]
impl Runner for Counting {
    type Model = Probe;

    fn build_model(&self, _: &TrainConfig) -> anyhow::Result<Probe> {
        Ok(Probe(vec![Parameter::new("w", vec![0.0, 0.0])]))
    }

    async fn do_train(
        &self,
        cfg: &TrainConfig,
        model: &mut DistributedModel<Probe>,
        _: bool,
    ) -> anyhow::Result<TrainedConfigs> {
        self.trains.fetch_add(1, Ordering::SeqCst);
        if self.fail_train {
            bail!("out of memory");
        }

        model.parameters_mut()[0].grad = Some(vec![1.0, 2.0]);
        model.synchronize().await?;

        Ok(TrainedConfigs::from([
            ("model_final".to_string(), cfg.clone()),
            ("model_final_alias".to_string(), cfg.clone()),
        ]))
    }

    async fn do_test(
        &self,
        _: &TrainConfig,
        _: &mut Probe,
        train_iter: Option<u64>,
    ) -> anyhow::Result<MetricsReport> {
        self.tests.fetch_add(1, Ordering::SeqCst);
        self.test_iters.lock().unwrap().push(train_iter);
        Ok(MetricsReport::from([("score".to_string(), 0.75)]))
    }
}

fn solo_ctx() -> WorkerContext {
    Topology::new(1, 1, 0).unwrap().context(0, DeviceKind::Cpu).unwrap()
}

fn cfg_in(dir: &Path) -> TrainConfig {
    TrainConfig {
        output_dir: dir.to_path_buf(),
        ..TrainConfig::default()
    }
}

#[tokio::test]
async fn eval_only_never_trains() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Counting::default();
    let ctx = solo_ctx();

    let output = PhaseController::new(&runner, &ctx, ProcessGroup::solo())
        .run(&cfg_in(dir.path()), true, true)
        .await
        .unwrap();

    assert_eq!(runner.trains.load(Ordering::SeqCst), 0);
    assert_eq!(runner.tests.load(Ordering::SeqCst), 1);
    assert_eq!(*runner.test_iters.lock().unwrap(), vec![None]);
    assert_eq!(output.trace, vec![Phase::Init, Phase::EvalOnly, Phase::Done]);
    assert!(output.trained.is_empty());
}

#[tokio::test]
async fn eval_only_reports_the_resumed_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = solo_ctx();
    let cfg = cfg_in(dir.path());

    let saved = Probe(vec![Parameter::new("w", vec![1.0, 1.0])]);
    let path = FileCheckpointer::new(dir.path(), true)
        .save("model_0000041", &saved, Some(41), AuxiliaryState::new())
        .unwrap()
        .unwrap();

    let runner = Counting::default();
    PhaseController::new(&runner, &ctx, ProcessGroup::solo())
        .run(&cfg, true, true)
        .await
        .unwrap();

    let weights = TrainConfig {
        model: workflow::config::ModelConfig {
            weights: path.display().to_string(),
            ..Default::default()
        },
        ..cfg
    };
    PhaseController::new(&runner, &ctx, ProcessGroup::solo())
        .run(&weights, true, false)
        .await
        .unwrap();

    assert_eq!(*runner.test_iters.lock().unwrap(), vec![Some(41), None]);
}

#[tokio::test]
async fn training_is_followed_by_a_single_test() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Counting::default();
    let ctx = solo_ctx();
    let args = WorkerArgs {
        cfg: cfg_in(dir.path()),
        runner: "counting".into(),
        eval_only: false,
        resume: false,
    };

    let result = job::run_job(&runner, &ctx, ProcessGroup::solo(), &args).await.unwrap();

    assert_eq!(runner.trains.load(Ordering::SeqCst), 1);
    assert_eq!(runner.tests.load(Ordering::SeqCst), 1);
    assert_eq!(*runner.test_iters.lock().unwrap(), vec![None]);
    assert_eq!(result.metrics, MetricsReport::from([("score".to_string(), 0.75)]));
    assert_eq!(result.accuracy, result.metrics);
    assert_eq!(
        result.model_configs.keys().collect::<Vec<_>>(),
        vec!["model_final", "model_final_alias"]
    );
    assert!(result.model_configs.values().all(|p| p.is_file()));
}

#[tokio::test]
async fn training_failures_are_not_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Counting {
        fail_train: true,
        ..Counting::default()
    };
    let ctx = solo_ctx();

    let err = PhaseController::new(&runner, &ctx, ProcessGroup::solo())
        .run(&cfg_in(dir.path()), false, false)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Runner(ref e) if e.to_string() == "out of memory"));
    assert_eq!(runner.tests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn two_workers_train_and_the_leader_reports() {
    let dir = tempfile::tempdir().unwrap();
    let addr = RendezvousAddr::free_local().unwrap();
    let topology = Topology::new(2, 1, 0).unwrap();
    let options = GroupOptions {
        collective_timeout: Some(Duration::from_secs(30)),
        join_timeout: Duration::from_secs(30),
    };

    let cfg = TrainConfig {
        seed: Some(3),
        runner: json!({"max_iter": 30, "checkpoint_period": 10}),
        ..cfg_in(dir.path())
    };

    let mut workers = JoinSet::new();
    for ctx in topology.local_contexts(DeviceKind::Cpu) {
        let addr = addr.clone();
        let args = WorkerArgs {
            cfg: cfg.clone(),
            runner: "linear".into(),
            eval_only: false,
            resume: false,
        };

        workers.spawn(async move {
            let group = ProcessGroup::rendezvous(&ctx, &addr, Backend::Tcp, options)
                .await
                .unwrap();

            let runner = LinearRunner::new(ctx.clone());
            let result = job::run_job(&runner, &ctx, group, &args).await.unwrap();
            (ctx.global_rank(), result)
        });
    }

    let mut results = workers.join_all().await;
    results.sort_by_key(|(rank, _)| *rank);

    let (_, leader) = &results[0];
    let final_cfg = &leader.model_configs["model_final"];
    assert!(final_cfg.is_file());
    assert!(leader.metrics.contains_key("mse"));

    let trained = TrainConfig::from_file(final_cfg).unwrap();
    let ckpt = FileCheckpointer::new(dir.path(), true);
    assert!(ckpt.has_checkpoint());
    assert_eq!(Path::new(&trained.model.weights), ckpt.checkpoint_path("model_final"));

    for step in [9, 19] {
        assert!(dir.path().join(format!("model_{step:07}.json")).is_file());
    }
}
