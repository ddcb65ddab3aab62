//! Scheduler-level scenarios over real processes and files.

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::context::StageContext;
    use crate::core::{StageStatus, Target};
    use crate::errors::ShellflowError;
    use crate::events::CollectingEventSink;
    use crate::naming::StageId;
    use crate::pipeline::{FailureMode, Scheduler};
    use crate::runner::{CommandBatch, ShellCommand};
    use crate::stages::{ShellStage, Stage, StageInputs, StageRef};
    use crate::testing::{
        engine_config, touch_stage, CountingStage, CyclicStage, FailingStage,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn scheduler(config: EngineConfig) -> (Scheduler, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let scheduler = Scheduler::new(config).unwrap().with_events(sink.clone());
        (scheduler, sink)
    }

    fn ids(stages: &[StageId]) -> Vec<&str> {
        stages.iter().map(StageId::as_str).collect()
    }

    fn shell_chain(dir: &Path) -> StageRef {
        let a = dir.join("a.txt");
        let b = dir.join("b.txt");
        let c = dir.join("c.txt");
        let stage_a = touch_stage("A", &[a.clone()]).into_ref();
        let stage_b = ShellStage::new("B")
            .requires(stage_a)
            .output(Target::new(&b))
            .batch(
                ShellCommand::new(format!("test -f {} && touch {}", a.display(), b.display()))
                    .input(&a)
                    .output(&b),
            )
            .into_ref();
        ShellStage::new("C")
            .requires(stage_b)
            .output(Target::new(&c))
            .batch(
                ShellCommand::new(format!("test -f {} && touch {}", b.display(), c.display()))
                    .input(&b)
                    .output(&c),
            )
            .into_ref()
    }

    #[tokio::test]
    async fn test_second_run_executes_nothing() {
        let dir = TempDir::new().unwrap();
        let terminal = shell_chain(dir.path());

        let (first, sink) = scheduler(engine_config(dir.path(), 2));
        let report = first.run(&[terminal.clone()]).await.unwrap();
        assert!(report.success());
        assert_eq!(ids(&report.executed), vec!["A", "B", "C"]);
        assert_eq!(sink.events_of_type("command.started").len(), 3);

        let (second, sink) = scheduler(engine_config(dir.path(), 2));
        let report = second.run(&[terminal]).await.unwrap();
        assert!(report.success());
        assert!(report.executed.is_empty());
        assert_eq!(ids(&report.pruned), vec!["C"]);
        assert!(sink.events_of_type("command.").is_empty());
        assert!(sink.events_of_type("stage.started").is_empty());
    }

    #[tokio::test]
    async fn test_changed_upstream_does_not_rerun_complete_stage() {
        let dir = TempDir::new().unwrap();
        let a = CountingStage::new("A").output(dir.path().join("a.txt"));
        let b = CountingStage::new("B")
            .output(dir.path().join("b.txt"))
            .requires(a.clone().into_ref());
        fs::write(dir.path().join("b.txt"), "stale").unwrap();
        fs::write(dir.path().join("a.txt"), "changed after b was built").unwrap();

        let (scheduler, _) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler.run(&[b.clone().into_ref()]).await.unwrap();

        assert_eq!(a.runs() + b.runs(), 0);
        assert_eq!(ids(&report.pruned), vec!["B"]);
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "stale");
    }

    #[tokio::test]
    async fn test_partial_index_pair_reruns_stage() {
        let dir = TempDir::new().unwrap();
        let vcf = dir.path().join("calls.vcf.gz");
        let tbi = dir.path().join("calls.vcf.gz.tbi");
        fs::write(&vcf, "").unwrap();

        let stage = ShellStage::new("index")
            .output(Target::indexed(&vcf, ".tbi"))
            .batch(ShellCommand::new(format!("touch {}", tbi.display())).output(&tbi))
            .into_ref();

        let (scheduler, _) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler.run(&[stage]).await.unwrap();

        assert_eq!(report.status("index"), Some(StageStatus::Complete));
        assert!(tbi.exists());
    }

    #[tokio::test]
    async fn test_failed_stage_outputs_removed_when_cleanup_enabled() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("t.n.cram");
        let stage = FailingStage::new("markdup", vec![out.clone()]).into_ref();

        let (scheduler, _) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler.run(&[stage]).await.unwrap();

        assert_eq!(report.status("markdup"), Some(StageStatus::Failed));
        assert!(!out.exists());

        let record = &report.failure_report().failures[0];
        assert_eq!(record.error_kind, "CommandExecutionError");
        assert_eq!(record.log_paths, vec![dir.path().join("logs/markdup.sh.log")]);
        assert!(record.log_paths[0].exists());
    }

    #[tokio::test]
    async fn test_failed_stage_outputs_kept_when_cleanup_disabled() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("t.n.cram");
        let stage = FailingStage::new("markdup", vec![out.clone()]).into_ref();

        let mut config = engine_config(dir.path(), 1);
        config.shell.remove_if_failed = false;
        let (scheduler, _) = scheduler(config);
        let report = scheduler.run(&[stage]).await.unwrap();

        assert_eq!(report.exit_code(), 1);
        assert_eq!(fs::read_to_string(&out).unwrap(), "partial\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dependency_order_with_spare_workers() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let a = CountingStage::new("A")
            .output(dir.path().join("a.txt"))
            .with_delay(Duration::from_millis(50))
            .with_journal(journal.clone());
        let b = CountingStage::new("B")
            .output(dir.path().join("b.txt"))
            .requires(a.into_ref())
            .with_journal(journal.clone());
        let c = CountingStage::new("C")
            .output(dir.path().join("c.txt"))
            .requires(b.into_ref())
            .with_journal(journal.clone());

        let (scheduler, _) = scheduler(engine_config(dir.path(), 4));
        let report = scheduler.run(&[c.into_ref()]).await.unwrap();

        assert!(report.success());
        assert_eq!(
            journal.lock().clone(),
            vec!["start:A", "finish:A", "start:B", "finish:B", "start:C", "finish:C"]
        );
    }

    #[tokio::test]
    async fn test_higher_priority_dispatched_first() {
        let dir = TempDir::new().unwrap();
        let low = CountingStage::new("low")
            .output(dir.path().join("low.txt"))
            .with_priority(10);
        let high = CountingStage::new("high")
            .output(dir.path().join("high.txt"))
            .with_priority(70);

        let (scheduler, sink) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler
            .run(&[low.into_ref(), high.into_ref()])
            .await
            .unwrap();

        assert_eq!(ids(&report.dispatch_order), vec!["high", "low"]);
        assert_eq!(sink.stages_for("stage.started"), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_discovery_order() {
        let dir = TempDir::new().unwrap();
        let stages: Vec<StageRef> = ["s1", "s2", "s3"]
            .iter()
            .map(|id| CountingStage::new(id).output(dir.path().join(id)).into_ref())
            .collect();

        let (scheduler, _) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler.run(&stages).await.unwrap();
        assert_eq!(ids(&report.dispatch_order), vec!["s1", "s2", "s3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_bound_is_respected() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<StageRef> = (0..6)
            .map(|i| {
                CountingStage::new(&format!("s{i}"))
                    .output(dir.path().join(format!("s{i}.txt")))
                    .with_delay(Duration::from_millis(30))
                    .with_journal(journal.clone())
                    .into_ref()
            })
            .collect();

        let (scheduler, _) = scheduler(engine_config(dir.path(), 2));
        let report = scheduler.run(&stages).await.unwrap();
        assert_eq!(report.executed.len(), 6);

        let mut active = 0usize;
        let mut peak = 0usize;
        for entry in journal.lock().iter() {
            if entry.starts_with("start:") {
                active += 1;
                peak = peak.max(active);
            } else {
                active -= 1;
            }
        }
        assert!(peak <= 2, "peak concurrency {peak}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_failure_keeps_sibling_shards() {
        let dir = TempDir::new().unwrap();
        let shards: Vec<PathBuf> = (0..4)
            .map(|i| dir.path().join(format!("shard{i}.vcf.gz")))
            .collect();
        let merged = dir.path().join("out.vcf.gz");

        let shard_commands: Vec<ShellCommand> = shards
            .iter()
            .enumerate()
            .map(|(i, shard)| {
                let cmd = if i == 2 {
                    format!("echo half > {} && sleep 0.05 && exit 1", shard.display())
                } else {
                    format!("sleep 0.1 && touch {}", shard.display())
                };
                ShellCommand::new(cmd).output(shard)
            })
            .collect();
        let merge = ShellCommand::new(format!(
            "cat {} > {}",
            shards
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" "),
            merged.display()
        ))
        .inputs(shards.iter())
        .output(&merged);

        let stage = ShellStage::new("call_sharded")
            .output(Target::new(&merged))
            .batch(CommandBatch::fan_out(shard_commands))
            .batch(merge)
            .into_ref();

        let (scheduler, sink) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler.run(&[stage]).await.unwrap();

        assert_eq!(report.status("call_sharded"), Some(StageStatus::Failed));
        for i in [0, 1, 3] {
            assert!(shards[i].exists(), "shard{i} should be retained");
        }
        assert!(!merged.exists());
        assert_eq!(sink.events_of_type("command.finished").len(), 4);
    }

    #[tokio::test]
    async fn test_cycle_detected_before_any_process() {
        let dir = TempDir::new().unwrap();
        let (scheduler, sink) = scheduler(engine_config(dir.path(), 2));

        let x: StageRef = Arc::new(CyclicStage::new("X", "Y"));
        let err = scheduler.run(&[x]).await.unwrap_err();

        assert!(matches!(err, ShellflowError::CycleDetected(_)));
        assert!(err.to_string().contains("X -> Y -> X"));
        assert!(sink.is_empty());
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_failure_withholds_dependents_only() {
        let dir = TempDir::new().unwrap();
        let broken = FailingStage::new("align_tumor", vec![dir.path().join("t.cram")]).into_ref();
        let caller = CountingStage::new("call")
            .output(dir.path().join("t.n.vcf.gz"))
            .requires(broken);
        let filter = CountingStage::new("filter")
            .output(dir.path().join("t.n.filtered.vcf.gz"))
            .requires(caller.clone().into_ref());
        let qc = CountingStage::new("qc").output(dir.path().join("n.qc.txt"));

        let (scheduler, sink) = scheduler(engine_config(dir.path(), 2));
        let report = scheduler
            .run(&[filter.clone().into_ref(), qc.clone().into_ref()])
            .await
            .unwrap();

        assert_eq!(ids(&report.failed), vec!["align_tumor"]);
        assert_eq!(ids(&report.executed), vec!["qc"]);
        assert_eq!(report.status("call"), Some(StageStatus::Withheld));
        assert_eq!(report.status("filter"), Some(StageStatus::Withheld));
        assert_eq!(caller.runs() + filter.runs(), 0);
        assert_eq!(qc.runs(), 1);
        assert_eq!(sink.events_of_type("stage.withheld").len(), 2);
        assert_eq!(report.failure_report().withheld.len(), 2);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_dispatching() {
        let dir = TempDir::new().unwrap();
        let broken = FailingStage::new("broken", vec![dir.path().join("x")])
            .without_partial_output()
            .into_ref();
        let later = CountingStage::new("later").output(dir.path().join("later.txt"));

        let config = engine_config(dir.path(), 1).with_failure_mode(FailureMode::FailFast);
        let (scheduler, _) = scheduler(config);
        let report = scheduler
            .run(&[broken, later.clone().into_ref()])
            .await
            .unwrap();

        assert_eq!(ids(&report.failed), vec!["broken"]);
        assert_eq!(ids(&report.withheld), vec!["later"]);
        assert_eq!(later.runs(), 0);
    }

    #[tokio::test]
    async fn test_outputs_appearing_before_dispatch_prune_stage() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared.txt");
        let first = CountingStage::new("first").output(&shared).with_priority(5);
        let second = CountingStage::new("second").output(&shared);

        let (scheduler, _) = scheduler(engine_config(dir.path(), 1));
        let report = scheduler
            .run(&[first.clone().into_ref(), second.clone().into_ref()])
            .await
            .unwrap();

        assert_eq!(first.runs(), 1);
        assert_eq!(second.runs(), 0);
        assert_eq!(ids(&report.pruned), vec!["second"]);
    }

    /// Splits its input into shards discovered at run time, then merges them.
    #[derive(Debug)]
    struct ScatterGather {
        dir: PathBuf,
        source: StageRef,
        shards: usize,
    }

    #[async_trait]
    impl Stage for ScatterGather {
        fn id(&self) -> StageId {
            StageId::new("gather")
        }

        fn dependencies(&self) -> Vec<StageRef> {
            vec![self.source.clone()]
        }

        fn outputs(&self, _inputs: &StageInputs) -> Vec<Target> {
            vec![Target::new(self.dir.join("gathered.txt"))]
        }

        fn plan(&self, inputs: &StageInputs) -> Result<Vec<StageRef>, ShellflowError> {
            let source = inputs
                .path(0, 0)
                .ok_or_else(|| ShellflowError::Internal("no source".to_string()))?;
            assert!(source.exists(), "plan runs after dependencies complete");
            Ok((0..self.shards)
                .map(|i| {
                    CountingStage::new(&format!("shard{i}"))
                        .output(self.dir.join(format!("shard{i}.txt")))
                        .into_ref()
                })
                .collect())
        }

        async fn run(&self, ctx: &StageContext) -> Result<(), ShellflowError> {
            let shards = ctx.dynamic_inputs().paths();
            let run = ctx.setup_shell("gather").build().await?;
            let command = format!(
                "cat {} > {}",
                shards
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
                ctx.outputs()[0].path().display()
            );
            run.run_shell(ShellCommand::new(command).inputs(shards)).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dynamic_sub_stages_run_before_planner() {
        let dir = TempDir::new().unwrap();
        let source = touch_stage("split_source", &[dir.path().join("source.txt")]).into_ref();
        let gather: StageRef = Arc::new(ScatterGather {
            dir: dir.path().to_path_buf(),
            source,
            shards: 3,
        });

        let (scheduler, sink) = scheduler(engine_config(dir.path(), 2));
        let report = scheduler.run(&[gather]).await.unwrap();

        assert!(report.success(), "{}", report.failure_report());
        assert_eq!(report.executed.len(), 5);
        assert_eq!(report.executed.last().map(StageId::as_str), Some("gather"));
        assert_eq!(
            fs::read_to_string(dir.path().join("gathered.txt")).unwrap(),
            "shard0shard1shard2"
        );
        assert_eq!(sink.stages_for("stage.planned"), vec!["gather"]);
    }

    /// Plans a sub-stage that requires the planner back.
    #[derive(Debug)]
    struct SelfReferentialPlanner {
        dir: PathBuf,
    }

    #[async_trait]
    impl Stage for SelfReferentialPlanner {
        fn id(&self) -> StageId {
            StageId::new("P")
        }

        fn outputs(&self, _inputs: &StageInputs) -> Vec<Target> {
            vec![Target::new(self.dir.join("p.txt"))]
        }

        fn plan(&self, _inputs: &StageInputs) -> Result<Vec<StageRef>, ShellflowError> {
            let planner: StageRef = Arc::new(Self {
                dir: self.dir.clone(),
            });
            Ok(vec![CountingStage::new("S")
                .output(self.dir.join("s.txt"))
                .requires(planner)
                .into_ref()])
        }

        async fn run(&self, _ctx: &StageContext) -> Result<(), ShellflowError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_planned_stage_requiring_its_planner_is_a_cycle() {
        let dir = TempDir::new().unwrap();
        let planner: StageRef = Arc::new(SelfReferentialPlanner {
            dir: dir.path().to_path_buf(),
        });

        let (scheduler, sink) = scheduler(engine_config(dir.path(), 2));
        let report = scheduler.run(&[planner]).await.unwrap();

        assert_eq!(ids(&report.failed), vec!["P"]);
        assert_eq!(ids(&report.withheld), vec!["S"]);
        assert_eq!(report.exit_code(), 1);

        let record = &report.failure_report().failures[0];
        assert_eq!(record.error_kind, "CycleError");
        assert!(record.error.contains("P -> S -> P"), "{}", record.error);
        assert!(sink.events_of_type("stage.started").is_empty());
        assert!(!report.failure_report().to_string().contains("succeeded"));
    }
}
