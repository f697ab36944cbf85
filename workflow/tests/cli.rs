use std::{
    path::Path,
    process::{Command, Output},
};

use workflow::{RunResult, TrainConfig, config::CONFIG_DUMP};

fn train_net(output_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_train_net"))
        .arg("--output-dir")
        .arg(output_dir)
        .args(args)
        .env("ORCHESTRA_POST_MORTEM", "report")
        .env_remove("ORCHESTRA_LOCAL_RANK")
        .output()
        .unwrap()
}

#[test]
fn two_local_workers_train_and_test() {
    let dir = tempfile::tempdir().unwrap();
    let out = train_net(
        dir.path(),
        &[
            "--num-processes",
            "2",
            "--collective-timeout-secs",
            "60",
            "seed=5",
            "runner.max_iter=40",
            "runner.checkpoint_period=10",
        ],
    );

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let result: RunResult = serde_json::from_slice(&out.stdout).unwrap();
    assert!(result.metrics.contains_key("mse"));
    assert_eq!(result.accuracy, result.metrics);

    let final_cfg = &result.model_configs["model_final"];
    assert!(final_cfg.is_file());

    let dumped = TrainConfig::from_file(&dir.path().join(CONFIG_DUMP)).unwrap();
    assert_eq!(dumped.seed, Some(5));

    let eval = train_net(
        dir.path(),
        &[
            "--eval-only",
            "seed=5",
            &format!("model.weights={}", dir.path().join("model_final.json").display()),
            "runner.max_iter=40",
        ],
    );
    assert!(eval.status.success(), "stderr: {}", String::from_utf8_lossy(&eval.stderr));

    let evaluated: RunResult = serde_json::from_slice(&eval.stdout).unwrap();
    assert!(evaluated.model_configs.is_empty());
    assert!((evaluated.metrics["mse"] - result.metrics["mse"]).abs() < 1e-9);
}

#[test]
fn failing_worker_fails_the_job_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let out = train_net(
        dir.path(),
        &[
            "--num-processes",
            "2",
            "runner.fail_on_rank=1",
            "runner.fail_at_iter=3",
        ],
    );

    assert!(!out.status.success());
    assert!(out.stdout.is_empty());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("post-mortem"), "stderr: {stderr}");
    assert!(stderr.contains("injected failure on rank 1 at iteration 3"), "stderr: {stderr}");
    assert!(!dir.path().join("model_final.json").exists());
}

#[test]
fn unknown_runners_are_rejected_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let out = train_net(dir.path(), &["--runner", "nope"]);

    assert!(!out.status.success());
    assert!(!dir.path().join(CONFIG_DUMP).exists());
}
