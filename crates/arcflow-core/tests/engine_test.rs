// End-to-end engine scenarios: packages driven through small workflows with
// a scripted task executor and the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use arcflow_core::{
    Engine, EngineConfig, JobStatus, MemoryStore, PackageStatus, ProcessingConfig,
    SharedDirectories, StateStore, Task, TaskExecutor, TaskOutcome, Workflow,
};

const CHAIN: &str = "11111111-1111-1111-1111-111111111111";
const LINK_A: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
const LINK_B: &str = "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb";
const LINK_C: &str = "cccccccc-cccc-cccc-cccc-cccccccccccc";

/// Scripted executor: exit codes by command name, optional per-task delay,
/// and a log of executed (execution, arguments) pairs. The "seed" command
/// materializes files named by its arguments inside the package directory.
struct ScriptedExecutor {
    exits: HashMap<String, i32>,
    delay: Duration,
    log: AsyncMutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    fn new(exits: &[(&str, i32)]) -> Self {
        Self {
            exits: exits
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            delay: Duration::ZERO,
            log: AsyncMutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn executions(&self) -> Vec<(String, String)> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskOutcome> {
        self.log
            .lock()
            .await
            .push((task.execution.clone(), task.arguments.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if task.execution == "seed" {
            // arguments: "<dir> <name> <name> ..."
            let mut parts = task.arguments.split_whitespace();
            let dir = parts.next().unwrap_or_default();
            for name in parts {
                tokio::fs::write(std::path::Path::new(dir).join(name), b"x").await?;
            }
            return Ok(TaskOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        // "scan" exits with the digit embedded in the file name, letting a
        // per-file batch produce a mixed set of exit codes.
        let exit_code = if task.execution == "scan" {
            task.filename
                .chars()
                .find(|c| c.is_ascii_digit())
                .and_then(|c| c.to_digit(10))
                .unwrap_or(0) as i32
        } else {
            self.exits.get(&task.execution).copied().unwrap_or(0)
        };

        Ok(TaskOutcome {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct Harness {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    executor: Arc<ScriptedExecutor>,
    runner: tokio::task::JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

fn harness(workflow: &str, executor: ScriptedExecutor, config: EngineConfig) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig {
        directories: SharedDirectories::under(tmp.path()),
        ..config
    };

    let workflow = Arc::new(Workflow::from_json(workflow).expect("workflow loads"));
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(executor);
    let engine = Arc::new(Engine::new(
        workflow,
        store.clone(),
        executor.clone(),
        config,
    ));

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    Harness {
        engine,
        store,
        executor,
        runner,
        _tmp: tmp,
    }
}

async fn wait_for_final(engine: &Engine, id: Uuid) -> PackageStatus {
    for _ in 0..500 {
        let report = engine.status(id).await.expect("status");
        if report.status != PackageStatus::Processing {
            return report.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("package {id} did not reach a final status");
}

/// `A --exit 0--> B(store) `: two jobs run in order, package completes.
#[tokio::test]
async fn test_happy_path_two_links() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "ok"},
                "description": "Verify checksums",
                "group": "Verify transfer",
                "exit_codes": {"0": {"next_link_id": LINK_B, "job_status": "completed_ok"}},
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let h = harness(&workflow, ScriptedExecutor::new(&[("ok", 0)]), EngineConfig::default());
    let id = h.engine.submit("demo", "file:///in", None).await.expect("submit");

    assert_eq!(wait_for_final(&h.engine, id).await, PackageStatus::Complete);

    let report = h.engine.status(id).await.unwrap();
    assert_eq!(report.jobs.len(), 2);
    assert_eq!(report.jobs[0].name, "Verify checksums");
    assert_eq!(report.jobs[1].name, "Store AIP");
    assert_eq!(report.jobs[0].status, JobStatus::CompletedOk);

    h.engine.stop();
    let _ = h.runner.await;
}

/// A task failure with an empty exit-code table follows the fallback edge
/// with the fallback status; the fallback link still runs.
#[tokio::test]
async fn test_failure_follows_fallback() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "flaky"},
                "description": "Scan for viruses",
                "group": "Scan for viruses",
                "fallback_link_id": LINK_B,
                "fallback_job_status": "failed",
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "rejected"},
                "description": "Reject transfer",
                "group": "Reject transfer",
                "end": true,
            },
        },
    })
    .to_string();

    let h = harness(&workflow, ScriptedExecutor::new(&[("flaky", 1)]), EngineConfig::default());
    let id = h.engine.submit("demo", "file:///in", None).await.expect("submit");

    // Final status reflects the fallback link's outcome.
    assert_eq!(wait_for_final(&h.engine, id).await, PackageStatus::Rejected);

    let report = h.engine.status(id).await.unwrap();
    assert_eq!(report.jobs.len(), 2);
    assert_eq!(report.jobs[0].status, JobStatus::Failed);
    assert_eq!(report.jobs[0].exit_code, Some(1));
    assert_eq!(report.jobs[1].status, JobStatus::CompletedOk);

    h.engine.stop();
    let _ = h.runner.await;
}

/// A per-file batch aggregates to the maximum task exit code; an unmapped
/// aggregate follows the fallback edge.
#[tokio::test]
async fn test_max_exit_aggregation_over_files() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {
                    "manager": "standard",
                    "execute": "seed",
                    "arguments": "%SIPDirectory% f0.txt f0b.txt f2.txt",
                },
                "description": "Seed files",
                "group": "Verify transfer",
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "standard", "execute": "scan", "scope": "files"},
                "description": "Identify formats",
                "group": "Identify formats",
                "exit_codes": {"0": {"next_link_id": LINK_C}},
                "fallback_link_id": LINK_C,
                "fallback_job_status": "failed",
            },
            LINK_C: {
                "config": {"manager": "output_decision", "outcome": "failed"},
                "description": "Failed transfer",
                "group": "Failed transfer",
                "end": true,
            },
        },
    })
    .to_string();

    let h = harness(&workflow, ScriptedExecutor::new(&[]), EngineConfig::default());
    let id = h.engine.submit("demo", "file:///in", None).await.expect("submit");

    assert_eq!(wait_for_final(&h.engine, id).await, PackageStatus::Failed);

    let report = h.engine.status(id).await.unwrap();
    assert_eq!(report.jobs.len(), 3);
    let scan_job = &report.jobs[1];
    assert_eq!(scan_job.name, "Identify formats");
    // max(0, 0, 2) = 2; 2 is unmapped so the fallback status applies
    assert_eq!(scan_job.exit_code, Some(2));
    assert_eq!(scan_job.status, JobStatus::Failed);

    let tasks = h.engine.list_tasks(scan_job.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    let mut exits: Vec<i32> = tasks.iter().filter_map(|t| t.exit_code).collect();
    exits.sort_unstable();
    assert_eq!(exits, vec![0, 0, 2]);

    h.engine.stop();
    let _ = h.runner.await;
}

/// With `max_concurrent_packages = 2`, five submissions never have more than
/// two packages active at once, and all five eventually finish.
#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "slow"},
                "description": "Slow step",
                "group": "Verify transfer",
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let config = EngineConfig {
        max_concurrent_packages: 2,
        ..EngineConfig::default()
    };
    let executor = ScriptedExecutor::new(&[("slow", 0)]).with_delay(Duration::from_millis(50));
    let h = harness(&workflow, executor, config);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            h.engine
                .submit(&format!("demo-{i}"), "file:///in", None)
                .await
                .expect("submit"),
        );
    }

    let mut all_done = false;
    for _ in 0..500 {
        assert!(
            h.engine.queue().active_count() <= 2,
            "active package count exceeded the cap"
        );
        let mut done = 0;
        for id in &ids {
            if h.engine.status(*id).await.unwrap().status == PackageStatus::Complete {
                done += 1;
            }
        }
        if done == ids.len() {
            all_done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(all_done, "not all packages completed");

    h.engine.stop();
    let _ = h.runner.await;
}

/// When a slot frees with DIP, SIP and Transfer packages all waiting, the
/// DIP is admitted first, then the SIP, then the Transfer.
#[tokio::test]
async fn test_admission_priority_dip_sip_transfer() {
    use arcflow_core::{Job, JobChain, Package, PackageType};

    let workflow_json = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "run", "arguments": "%SIPUUID%"},
                "description": "Run",
                "group": "Verify transfer",
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let config = EngineConfig {
        max_concurrent_packages: 1,
        ..EngineConfig::default()
    };
    let executor = ScriptedExecutor::new(&[("run", 0)]).with_delay(Duration::from_millis(150));
    let h = harness(&workflow_json, executor, config);
    let ctx = h.engine.context();

    let schedule = |kind: Option<PackageType>| {
        let ctx = ctx.clone();
        let engine = h.engine.clone();
        async move {
            let mut package = Package::create(
                ctx.store.as_ref(),
                "pkg",
                "file:///in",
                ProcessingConfig::default(),
                ctx.config.directories.clone(),
            )
            .await
            .expect("create package");
            if let Some(kind) = kind {
                package.set_kind(kind);
            }
            let uuid = package.uuid();
            let kind = package.kind();
            let chain = JobChain::new(ctx.workflow.clone(), ctx.workflow.get_initiator())
                .expect("chain");
            let link = chain.current_link().expect("start link");
            let job = Job::new(
                link,
                chain,
                Arc::new(tokio::sync::Mutex::new(package)),
                uuid,
                kind,
            );
            engine.queue().schedule_job(job).await.expect("schedule");
            uuid
        }
    };

    // Fill the single slot, then queue one of each class while it runs.
    let first = schedule(None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let transfer = schedule(None).await;
    let sip = schedule(Some(PackageType::Sip)).await;
    let dip = schedule(Some(PackageType::Dip)).await;

    for id in [first, dip, sip, transfer] {
        assert_eq!(wait_for_final(&h.engine, id).await, PackageStatus::Complete);
    }

    let order: Vec<Uuid> = h
        .executor
        .executions()
        .await
        .into_iter()
        .filter(|(execution, _)| execution == "run")
        .map(|(_, arguments)| arguments.parse().expect("uuid argument"))
        .collect();
    assert_eq!(order, vec![first, dip, sip, transfer]);

    h.engine.stop();
    let _ = h.runner.await;
}

/// Submissions beyond the waiting-queue cap fail with QueueFull and leave
/// the queues untouched.
#[tokio::test]
async fn test_queue_full_rejects_submission() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "slow"},
                "description": "Slow step",
                "group": "Verify transfer",
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let config = EngineConfig {
        max_concurrent_packages: 1,
        max_queued_packages: 1,
        ..EngineConfig::default()
    };
    let executor = ScriptedExecutor::new(&[("slow", 0)]).with_delay(Duration::from_millis(200));
    let h = harness(&workflow, executor, config);

    let first = h.engine.submit("one", "file:///in", None).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _second = h.engine.submit("two", "file:///in", None).await.expect("submit");

    let err = h.engine.submit("three", "file:///in", None).await.unwrap_err();
    assert!(
        matches!(
            err,
            arcflow_core::EngineError::Queue(arcflow_core::QueueError::Full)
        ),
        "unexpected error: {err}"
    );

    assert_eq!(wait_for_final(&h.engine, first).await, PackageStatus::Complete);
    h.engine.stop();
    let _ = h.runner.await;
}

/// `stop()` drains cleanly: `work()` returns, in-flight jobs are not left
/// running, and no further submissions are admitted.
#[tokio::test]
async fn test_graceful_shutdown_mid_job() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "slow"},
                "description": "Slow step",
                "group": "Verify transfer",
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let config = EngineConfig {
        max_concurrent_packages: 2,
        shutdown_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let executor = ScriptedExecutor::new(&[("slow", 0)]).with_delay(Duration::from_millis(150));
    let h = harness(&workflow, executor, config);

    h.engine.submit("one", "file:///in", None).await.expect("submit");
    h.engine.submit("two", "file:///in", None).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(30)).await;

    h.engine.stop();
    tokio::time::timeout(Duration::from_secs(5), h.runner)
        .await
        .expect("work() returned before the deadline")
        .expect("runner task");

    let err = h.engine.submit("three", "file:///in", None).await.unwrap_err();
    assert!(matches!(
        err,
        arcflow_core::EngineError::Queue(arcflow_core::QueueError::Shutdown)
    ));
}

/// A choice link with no pre-recorded decision parks the package awaiting
/// input and frees its concurrency slot; a pre-recorded decision selects
/// the next link without pausing.
#[tokio::test]
async fn test_choice_decision_handling() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {
                    "manager": "choice",
                    "choices": [{"label": "Store", "link_id": LINK_B}],
                },
                "description": "Store AIP?",
                "group": "Store AIP",
            },
            LINK_B: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let h = harness(&workflow, ScriptedExecutor::new(&[]), EngineConfig::default());

    // Without a decision: the package parks and the slot frees.
    let parked = h.engine.submit("undecided", "file:///in", None).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.queue().active_count(), 0);
    let report = h.engine.status(parked).await.unwrap();
    assert_eq!(report.status, PackageStatus::Processing);
    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].status, JobStatus::AwaitingDecision);

    // With a pre-recorded decision the chain continues to completion.
    use arcflow_core::{Job, JobChain, Package, UnitVariableRecord};
    let ctx = h.engine.context();
    let package = Package::create(
        ctx.store.as_ref(),
        "decided",
        "file:///in",
        ProcessingConfig::default(),
        ctx.config.directories.clone(),
    )
    .await
    .expect("create");
    ctx.store
        .set_unit_variable(&UnitVariableRecord {
            unit_type: "Transfer".to_string(),
            unit_id: package.sub_id(),
            variable: LINK_A.to_string(),
            value: LINK_B.to_string(),
            chain_link_id: None,
        })
        .await
        .expect("record decision");

    let decided = package.uuid();
    let kind = package.kind();
    let chain = JobChain::new(ctx.workflow.clone(), ctx.workflow.get_initiator()).unwrap();
    let link = chain.current_link().unwrap();
    let job = Job::new(
        link,
        chain,
        Arc::new(tokio::sync::Mutex::new(package)),
        decided,
        kind,
    );
    h.engine.queue().schedule_job(job).await.expect("schedule");

    assert_eq!(wait_for_final(&h.engine, decided).await, PackageStatus::Complete);

    h.engine.stop();
    let _ = h.runner.await;
}

/// A link flagged `start_ingest` moves the package into the Ingest stage:
/// later jobs are recorded against the SIP unit.
#[tokio::test]
async fn test_start_ingest_switches_unit() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {"manager": "standard", "execute": "ok"},
                "description": "Create SIP from transfer",
                "group": "Create SIP from transfer",
                "start_ingest": true,
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "standard", "execute": "ok"},
                "description": "Prepare AIP",
                "group": "Prepare AIP",
                "exit_codes": {"0": {"next_link_id": LINK_C}},
            },
            LINK_C: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let h = harness(&workflow, ScriptedExecutor::new(&[("ok", 0)]), EngineConfig::default());
    let id = h.engine.submit("demo", "file:///in", None).await.expect("submit");
    assert_eq!(wait_for_final(&h.engine, id).await, PackageStatus::Complete);

    let record = h.store.get_package(id).await.unwrap().unwrap();
    let transfer_jobs = h.store.list_jobs(record.transfer_id).await.unwrap();
    let sip_jobs = h.store.list_jobs(record.sip_id).await.unwrap();
    assert_eq!(transfer_jobs.len(), 1);
    assert_eq!(transfer_jobs[0].name, "Create SIP from transfer");
    assert_eq!(sip_jobs.len(), 2);
    assert_eq!(sip_jobs[0].name, "Prepare AIP");

    h.engine.stop();
    let _ = h.runner.await;
}

/// Set-variable links persist a unit variable; get-variable links follow the
/// stored link id when they have no edge of their own.
#[tokio::test]
async fn test_set_then_get_variable_link_pull() {
    let workflow = serde_json::json!({
        "initiator": CHAIN,
        "chains": {CHAIN: {"description": "Default", "start_link_id": LINK_A}},
        "links": {
            LINK_A: {
                "config": {
                    "manager": "set_variable",
                    "variable": "resume-point",
                    "value": "normalization",
                    "chain_link_id": LINK_C,
                },
                "description": "Remember resume point",
                "group": "Normalize",
                "exit_codes": {"0": {"next_link_id": LINK_B}},
            },
            LINK_B: {
                "config": {"manager": "get_variable", "variable": "resume-point"},
                "description": "Jump to resume point",
                "group": "Normalize",
            },
            LINK_C: {
                "config": {"manager": "output_decision", "outcome": "complete"},
                "description": "Store AIP",
                "group": "Store AIP",
                "end": true,
            },
        },
    })
    .to_string();

    let h = harness(&workflow, ScriptedExecutor::new(&[]), EngineConfig::default());
    let id = h.engine.submit("demo", "file:///in", None).await.expect("submit");
    assert_eq!(wait_for_final(&h.engine, id).await, PackageStatus::Complete);

    let report = h.engine.status(id).await.unwrap();
    let names: Vec<&str> = report.jobs.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Remember resume point", "Jump to resume point", "Store AIP"]
    );

    h.engine.stop();
    let _ = h.runner.await;
}
