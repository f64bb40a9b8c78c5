//! End-to-end matrix runs against real processes and in-memory / on-disk ledgers.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use matrixci_core::{
    plan, plan_all, Event, FsRunLedger, MemoryRunLedger, RunLedger, RunPlan, RunStatus,
    RunnerConfig, Workflow,
};
use matrixci_runner::{CiGate, CellVerdict, FailureKind, Scheduler, StepStatus};

fn workflow(yaml: &str) -> Workflow {
    let wf = Workflow::from_yaml(yaml).expect("workflow parses");
    wf.validate().expect("workflow is valid");
    wf
}

fn push_plan(yaml: &str) -> RunPlan {
    plan(&workflow(yaml), &Event::push("main"))
        .expect("planning succeeds")
        .expect("push to main triggers")
}

fn config(source: &Path) -> Arc<RunnerConfig> {
    let mut config = RunnerConfig::default()
        .with_source_dir(source)
        .with_max_parallel(4);
    config.kill_grace = Duration::from_millis(200);
    Arc::new(config)
}

fn quote(path: &Path) -> String {
    format!("'{}'", path.display())
}

/// Test: 2×2 matrix, every cell checks out the source and sees its own values
#[tokio::test]
async fn test_two_by_two_matrix_all_pass() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("input.txt"), "fixture\n").unwrap();

    let plan = push_plan(
        r#"
name: grid
on:
  push:
    branches: [main]
strategy:
  matrix:
    os: [alpha, beta]
    version: ["1", "2"]
steps:
  - uses: checkout
  - name: Use fixture
    run: |
      test -f input.txt
      echo "$MATRIX_OS/$MATRIX_VERSION ${{ matrix.os }}-${{ matrix.version }}"
"#,
    );
    assert_eq!(plan.cells.len(), 4);

    let ledger = Arc::new(MemoryRunLedger::new());
    let report = Scheduler::run(ledger.clone(), plan, config(source.path()))
        .await
        .expect("matrix run");

    assert!(report.success(), "all cells should pass: {:?}", report.cells);
    assert_eq!(report.passed_count(), 4);
    assert!(report.cells[3].steps[1]
        .stdout
        .contains("beta/2 beta-2"));

    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 4);
    for cell in &report.cells {
        let events = ledger.get_events(cell.run_id.as_ref().unwrap()).await.unwrap();
        let verdict = CiGate::evaluate(&events);
        assert!(verdict.passed, "{}: {:?}", cell.label(), verdict.violations);
    }
}

/// Test: a failing step halts its own cell only; later steps never run
#[tokio::test]
async fn test_fail_fast_is_per_cell() {
    let source = tempfile::tempdir().unwrap();
    let markers = tempfile::tempdir().unwrap();

    let plan = push_plan(&format!(
        r#"
name: fail-fast
on: push
env:
  MARKERS: {markers}
strategy:
  matrix:
    os: [good, bad]
steps:
  - run: touch "$MARKERS/${{{{ matrix.os }}}}-1"
  - name: Gate
    run: test "${{{{ matrix.os }}}}" != bad
  - run: touch "$MARKERS/${{{{ matrix.os }}}}-3"
"#,
        markers = quote(markers.path())
    ));

    let ledger = Arc::new(MemoryRunLedger::new());
    let report = Scheduler::run(ledger.clone(), plan, config(source.path()))
        .await
        .unwrap();

    let good = &report.cells[0];
    let bad = &report.cells[1];
    assert!(good.passed());
    assert_eq!(
        bad.verdict,
        CellVerdict::Failure {
            kind: FailureKind::Step,
            step: Some("Gate".to_string()),
            message: "exited with code 1".to_string(),
        }
    );
    assert_eq!(bad.steps[2].status, StepStatus::Skipped);

    assert!(markers.path().join("good-1").exists());
    assert!(markers.path().join("good-3").exists());
    assert!(markers.path().join("bad-1").exists());
    assert!(!markers.path().join("bad-3").exists());

    let bad_events = ledger.get_events(bad.run_id.as_ref().unwrap()).await.unwrap();
    assert!(bad_events.iter().any(|e| e.kind == "step_skipped"));
    assert!(!CiGate::evaluate(&bad_events).passed);
    assert!(!report.success());
}

/// Test: a cell exceeding its timeout is timed_out and its sibling is unaffected
#[tokio::test]
async fn test_cell_timeout_leaves_siblings_alone() {
    let source = tempfile::tempdir().unwrap();
    let plan = push_plan(
        r#"
name: timeouts
on: push
timeout_minutes: 0.02
strategy:
  matrix:
    os: [slow, fast]
steps:
  - name: Hang
    run: sleep 30
    when:
      matrix:
        os: slow
  - run: echo done
"#,
    );

    let ledger = Arc::new(MemoryRunLedger::new());
    let started = std::time::Instant::now();
    let report = Scheduler::run(ledger.clone(), plan, config(source.path()))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));

    let slow = &report.cells[0];
    let fast = &report.cells[1];
    assert!(matches!(
        &slow.verdict,
        CellVerdict::TimedOut { step: Some(step), .. } if step == "Hang"
    ));
    assert_eq!(slow.steps[1].status, StepStatus::Skipped);
    assert!(fast.passed());
    assert_eq!(fast.steps[0].status, StepStatus::Skipped);
    assert_eq!(report.timed_out_count(), 1);
    assert_eq!(report.failed_count(), 1);

    let record = ledger.get_run(slow.run_id.as_ref().unwrap()).await.unwrap();
    assert_eq!(record.status, RunStatus::TimedOut);
    let record = ledger.get_run(fast.run_id.as_ref().unwrap()).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
}

/// Test: events that do not satisfy any trigger rule plan nothing
#[test]
fn test_non_matching_events_plan_nothing() {
    let wf = workflow(
        r#"
name: triggers
on:
  push:
    branches: [main]
  pull_request:
    branches: [main]
steps:
  - run: echo hi
"#,
    );
    assert!(plan(&wf, &Event::push("feature/x")).unwrap().is_none());
    assert!(plan(&wf, &Event::pull_request("develop")).unwrap().is_none());
    assert!(plan(&wf, &Event::pull_request("main")).unwrap().is_some());
}

/// Test: re-running the same trigger creates fresh runs and workspaces
#[tokio::test]
async fn test_rerun_creates_new_runs() {
    let source = tempfile::tempdir().unwrap();
    let yaml = "name: again\non: push\nsteps:\n  - run: echo $MATRIXCI_WORKSPACE\n";
    let ledger = Arc::new(MemoryRunLedger::new());

    let first = Scheduler::run(ledger.clone(), push_plan(yaml), config(source.path()))
        .await
        .unwrap();
    let second = Scheduler::run(ledger.clone(), push_plan(yaml), config(source.path()))
        .await
        .unwrap();

    let a = &first.cells[0];
    let b = &second.cells[0];
    assert_ne!(a.run_id, b.run_id);
    assert_ne!(a.steps[0].stdout, b.steps[0].stdout);

    let digest = plan_all(&workflow(yaml), &Event::push("main"))
        .unwrap()
        .cells[0]
        .spec_digest
        .clone();
    let runs = ledger.list_runs(Some(&digest)).await.unwrap();
    assert_eq!(runs.len(), 2);
}

/// Test: cells and reruns each get a private HOME, so state left behind never leaks
#[tokio::test]
async fn test_rerun_does_not_see_previous_home() {
    let source = tempfile::tempdir().unwrap();
    let yaml = r#"
name: home
on: push
strategy:
  matrix:
    os: [a, b]
steps:
  - name: Fresh home
    run: test ! -e "$HOME/.matrixci-home-marker"
  - run: touch "$HOME/.matrixci-home-marker" "$TMPDIR/scratch" "$XDG_CACHE_HOME/cached"
"#;
    let ledger = Arc::new(MemoryRunLedger::new());

    let first = Scheduler::run(ledger.clone(), push_plan(yaml), config(source.path()))
        .await
        .unwrap();
    let second = Scheduler::run(ledger.clone(), push_plan(yaml), config(source.path()))
        .await
        .unwrap();

    assert!(first.success(), "{:?}", first.cells);
    assert!(second.success(), "{:?}", second.cells);
    let host_home = std::env::var_os("HOME").map(std::path::PathBuf::from);
    if let Some(home) = host_home {
        assert!(!home.join(".matrixci-home-marker").exists());
    }
}

/// Test: cells on labels this host does not serve fail provisioning
#[tokio::test]
async fn test_unserved_runner_label() {
    let source = tempfile::tempdir().unwrap();
    let plan = push_plan(
        r#"
name: labels
on: push
strategy:
  matrix:
    os: [ubuntu-22.04, windows-latest]
steps:
  - run: echo hi
"#,
    );
    let mut config = (*config(source.path())).clone();
    config.host_labels = vec!["ubuntu-*".to_string()];

    let ledger = Arc::new(MemoryRunLedger::new());
    let report = Scheduler::run(ledger, plan, Arc::new(config)).await.unwrap();

    assert!(report.cells[0].passed());
    assert_eq!(report.cells[1].runner_label, "windows-latest");
    assert!(matches!(
        report.cells[1].verdict,
        CellVerdict::Failure {
            kind: FailureKind::Provisioning,
            ..
        }
    ));
}

/// Test: the on-disk ledger keeps records and event logs per run
#[tokio::test]
async fn test_fs_ledger_persists_runs() {
    let source = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let ledger = Arc::new(FsRunLedger::new(state.path()).unwrap());

    let report = Scheduler::run(
        ledger.clone(),
        push_plan("name: disk\non: push\nsteps:\n  - run: echo persisted\n  - run: exit 2\n"),
        config(source.path()),
    )
    .await
    .unwrap();

    let run_id = report.cells[0].run_id.clone().unwrap();
    let run_dir = state.path().join("runs").join(&run_id.0);
    assert!(run_dir.join("record.json").is_file());
    assert!(run_dir.join("events.jsonl").is_file());

    let reopened = FsRunLedger::new(state.path()).unwrap();
    let record = reopened.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    let kinds: Vec<String> = reopened
        .get_events(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "cell_started",
            "step_started",
            "step_finished",
            "step_started",
            "step_failed",
            "cell_finished"
        ]
    );
}
