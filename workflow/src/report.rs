use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::{Component, Path, PathBuf},
};

use launcher::{ProcessGroup, WorkerContext};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, WorkflowError},
    phases::PhaseOutput,
    runner::TrainedConfigs,
};

/// The directory, inside the output directory, trained model configs are dumped to.
pub const TRAINED_MODEL_CONFIGS: &str = "trained_model_configs";

/// Metric name to value.
pub type MetricsReport = BTreeMap<String, f64>;

/// The outcome of a job as seen by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(with = "metric_values")]
    pub accuracy: MetricsReport,
    /// Trained model name to its dumped config.
    pub model_configs: BTreeMap<String, PathBuf>,
    #[serde(with = "metric_values")]
    pub metrics: MetricsReport,
}

/// A report as it travels between ranks.
#[derive(Serialize, Deserialize)]
struct WireMetrics(#[serde(with = "metric_values")] MetricsReport);

/// JSON has no NaN or infinities, those are written as the strings `"NaN"`, `"inf"` and
/// `"-inf"`. Finite values stay plain numbers.
mod metric_values {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

    use super::MetricsReport;

    pub fn serialize<S: Serializer>(metrics: &MetricsReport, s: S) -> Result<S::Ok, S::Error> {
        s.collect_map(metrics.iter().map(|(name, value)| (name, Value(*value))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<MetricsReport, D::Error> {
        BTreeMap::<String, Repr>::deserialize(d)?
            .into_iter()
            .map(|(name, repr)| repr.into_f64().map(|value| (name, value)).map_err(D::Error::custom))
            .collect()
    }

    struct Value(f64);

    impl Serialize for Value {
        fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            if self.0.is_finite() {
                s.serialize_f64(self.0)
            } else {
                s.collect_str(&self.0)
            }
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    impl Repr {
        fn into_f64(self) -> Result<f64, String> {
            match self {
                Repr::Number(value) => Ok(value),
                Repr::Text(text) => match text.parse::<f64>() {
                    Ok(value) if !value.is_finite() => Ok(value),
                    _ => Err(format!("{text:?} is not a metric value")),
                },
            }
        }
    }
}

/// Merges per rank reports given in rank order, earlier ranks win on conflicting keys.
pub fn merge_metrics<I>(reports: I) -> MetricsReport
where
    I: IntoIterator<Item = MetricsReport>,
{
    let mut merged = MetricsReport::new();
    for report in reports {
        for (name, value) in report {
            merged.entry(name).or_insert(value);
        }
    }

    merged
}

/// Collects every rank's metrics on the leader.
///
/// # Returns
/// The merged report on the leader, the local report everywhere else.
pub async fn gather_metrics(group: &ProcessGroup, local: MetricsReport) -> Result<MetricsReport> {
    let local = WireMetrics(local);
    match group.gather(&local).await? {
        Some(reports) => Ok(merge_metrics(reports.into_iter().map(|r| r.0))),
        None => Ok(local.0),
    }
}

/// Dumps every trained config to `<output_dir>/trained_model_configs/<name>.json`.
///
/// The leader writes, every rank waits at a barrier until the files are in place. Names
/// that are not a single path component are rejected on every rank before anything is
/// written.
///
/// # Returns
/// Every name with the path its config was dumped to.
pub async fn dump_trained_model_configs(
    ctx: &WorkerContext,
    group: &ProcessGroup,
    output_dir: &Path,
    trained: &TrainedConfigs,
) -> Result<BTreeMap<String, PathBuf>> {
    let dir = output_dir.join(TRAINED_MODEL_CONFIGS);
    if let Some(name) = trained.keys().find(|name| !is_plain_name(name)) {
        return Err(WorkflowError::Config(format!(
            "trained model name {name:?} must be a single path component"
        )));
    }

    let paths: BTreeMap<_, _> = trained
        .keys()
        .map(|name| (name.clone(), dir.join(format!("{name}.json"))))
        .collect();

    if ctx.is_leader() && !trained.is_empty() {
        fs::create_dir_all(&dir)?;
        for (name, cfg) in trained {
            let path = &paths[name];
            fs::write(path, serde_json::to_vec_pretty(cfg)?)?;
            info!("dumped trained config {name} to {}", path.display());
        }
    }

    group.barrier().await?;
    Ok(paths)
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == name
    )
}

/// Renders metrics as a markdown table.
pub fn format_metrics_table(metrics: &MetricsReport) -> String {
    let width = metrics
        .keys()
        .map(String::len)
        .chain(["metric".len()])
        .max()
        .unwrap_or_default();

    let mut table = String::new();
    let _ = writeln!(table, "| {:<width$} | {:>12} |", "metric", "value");
    let _ = writeln!(table, "|:{}|{}:|", "-".repeat(width + 1), "-".repeat(13));
    for (name, value) in metrics {
        let _ = writeln!(table, "| {name:<width$} | {value:>12.4} |");
    }

    table
}

pub fn print_metrics_table(metrics: &MetricsReport) {
    info!("metrics:\n{}", format_metrics_table(metrics));
}

/// Turns the local outcome of the phases into the job's result.
///
/// Runs on every rank, only the leader's result is authoritative.
pub async fn aggregate(
    ctx: &WorkerContext,
    group: &ProcessGroup,
    output_dir: &Path,
    output: PhaseOutput,
) -> Result<RunResult> {
    let metrics = gather_metrics(group, output.metrics).await?;
    let model_configs = dump_trained_model_configs(ctx, group, output_dir, &output.trained).await?;

    if ctx.is_leader() {
        print_metrics_table(&metrics);
    }

    Ok(RunResult {
        accuracy: metrics.clone(),
        model_configs,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use launcher::{DeviceKind, Topology};

    use super::*;
    use crate::config::TrainConfig;

    fn report(pairs: &[(&str, f64)]) -> MetricsReport {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn leader_values_win_and_gaps_are_filled_in_rank_order() {
        let merged = merge_metrics([
            report(&[("ap", 40.0)]),
            report(&[("ap", 10.0), ("ap50", 60.0)]),
            report(&[("ap50", 1.0), ("ap75", 30.0)]),
        ]);

        assert_eq!(merged, report(&[("ap", 40.0), ("ap50", 60.0), ("ap75", 30.0)]));
    }

    #[test]
    fn tables_list_every_metric() {
        let table = format_metrics_table(&report(&[("mse", 0.25), ("a_really_long_metric", 1.0)]));
        let lines: Vec<_> = table.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("a_really_long_metric"));
        assert!(lines[3].contains("0.2500"));
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }

    #[tokio::test]
    async fn leader_dumps_trained_configs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Topology::new(1, 1, 0).unwrap().context(0, DeviceKind::Cpu).unwrap();
        let group = ProcessGroup::solo();

        let trained = TrainedConfigs::from([
            ("model_final".to_string(), TrainConfig::default()),
            ("model_ema".to_string(), TrainConfig::default()),
        ]);

        let paths = dump_trained_model_configs(&ctx, &group, dir.path(), &trained).await.unwrap();

        assert_eq!(paths.len(), 2);
        let dumped = TrainConfig::from_file(&paths["model_final"]).unwrap();
        assert_eq!(dumped, TrainConfig::default());
        assert!(paths["model_ema"].ends_with("trained_model_configs/model_ema.json"));
    }

    #[tokio::test]
    async fn non_finite_metrics_survive_the_gather() {
        let local = report(&[("ap", f64::NAN), ("ap50", 60.0), ("loss", f64::INFINITY)]);

        let merged = gather_metrics(&ProcessGroup::solo(), local).await.unwrap();

        assert!(merged["ap"].is_nan());
        assert_eq!(merged["ap50"], 60.0);
        assert_eq!(merged["loss"], f64::INFINITY);
    }

    #[test]
    fn run_results_with_non_finite_metrics_cross_process_boundaries() {
        let metrics = report(&[("ap", f64::NAN), ("ap75", f64::NEG_INFINITY), ("ap50", 1.5)]);
        let result = RunResult {
            accuracy: metrics.clone(),
            model_configs: BTreeMap::from([("model_final".into(), PathBuf::from("out/m.json"))]),
            metrics,
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["metrics"]["ap"], "NaN");
        assert_eq!(value["metrics"]["ap50"], 1.5);

        let back: RunResult = serde_json::from_value(value).unwrap();
        assert!(back.metrics["ap"].is_nan());
        assert!(back.accuracy["ap"].is_nan());
        assert_eq!(back.metrics["ap75"], f64::NEG_INFINITY);
        assert_eq!(back.model_configs, result.model_configs);

        let printed = serde_json::to_string_pretty(&result).unwrap();
        let reparsed: RunResult = serde_json::from_str(&printed).unwrap();
        assert_eq!(reparsed.metrics["ap50"], 1.5);
    }

    #[test]
    fn unknown_metric_strings_are_rejected() {
        let value = serde_json::json!({"accuracy": {}, "model_configs": {}, "metrics": {"ap": "high"}});
        assert!(serde_json::from_value::<RunResult>(value).is_err());
    }

    #[tokio::test]
    async fn trained_names_cannot_leave_the_configs_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Topology::new(1, 1, 0).unwrap().context(0, DeviceKind::Cpu).unwrap();
        let group = ProcessGroup::solo();

        for name in ["../escaped", "nested/model", "", ".", "/abs"] {
            let trained = TrainedConfigs::from([(name.to_string(), TrainConfig::default())]);
            let err = dump_trained_model_configs(&ctx, &group, dir.path(), &trained)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Config(_)), "{name:?}: {err}");
        }

        assert!(!dir.path().join(TRAINED_MODEL_CONFIGS).exists());
        assert!(!dir.path().join("escaped.json").exists());
    }
}
