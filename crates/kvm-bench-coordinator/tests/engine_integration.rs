//! End-to-end runs of the coordinator against in-memory collaborators
//!
//! Every test runs on a paused clock, so readiness polling, step timeouts,
//! retry backoff and the run deadline all elapse instantly.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use kvm_bench_common::{BenchmarkStep, LifecycleState, RunStatus, StepStatus, VmSpec};
use kvm_bench_test_utils::{
    FakeHypervisor, HypervisorCall, RejectingParser, Scripted, ScriptedSessions, matrix, spec, step,
};
use test_utils::Harness;

fn suite() -> Vec<BenchmarkStep> {
    vec![
        step("cpu", "sysbench cpu --threads={vcpus} run"),
        step("disk", "fio --name=randrw --size=1G"),
        step("net", "iperf3 -c 192.168.122.1"),
    ]
}

fn ids(specs: &[VmSpec]) -> Vec<String> {
    specs.iter().map(|s| s.id.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_all_steps_succeed_on_every_vm() {
    let harness = Harness::new(FakeHypervisor::new(), ScriptedSessions::new(), suite());
    let specs = matrix();

    let report = harness.coordinator().execute(&specs).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.entries.iter().map(|e| e.vm_spec_id.clone()).collect::<Vec<_>>(),
        ids(&specs)
    );
    for entry in &report.entries {
        assert!(entry.reached_ready, "{} never ready", entry.vm_spec_id);
        assert_eq!(entry.final_state, LifecycleState::Destroyed);
        let names: Vec<_> = entry.results.iter().map(|r| r.benchmark.as_str()).collect();
        assert_eq!(names, ["cpu", "disk", "net"]);
        for result in &entry.results {
            assert_eq!(result.status, StepStatus::Success);
            assert_eq!(result.attempt_count, 1);
            assert_eq!(result.metrics.get("score"), Some(&1.0));
        }
    }
    assert_eq!(report.records().len(), 9);
    assert!(report.warnings.is_empty());

    assert!(harness.registry().is_empty());
    assert!(harness.hypervisor.live_domains().is_empty());
    assert_eq!(harness.hypervisor.defined_total(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_step_commands_rendered_per_spec() {
    let harness = Harness::new(FakeHypervisor::new(), ScriptedSessions::new(), suite());
    harness.coordinator().execute(&matrix()).await;

    let cpu_commands: Vec<String> = harness
        .sessions
        .executed()
        .into_iter()
        .map(|(_, cmd)| cmd)
        .filter(|cmd| cmd.starts_with("sysbench"))
        .collect();
    assert_eq!(cpu_commands.len(), 3);
    for threads in [1, 2, 4] {
        let expected = format!("sysbench cpu --threads={threads} run");
        assert!(cpu_commands.contains(&expected), "missing {expected}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_does_not_stop_the_suite() {
    let sessions = ScriptedSessions::new().on("fio", [Scripted::exit(1, "fio: disk full")]);
    let harness = Harness::new(FakeHypervisor::new(), sessions, suite());

    let report = harness.coordinator().execute(&matrix()).await;

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    for entry in &report.entries {
        let disk = &entry.results[1];
        assert_eq!(disk.status, StepStatus::Failed);
        // Non-zero exit is not retried
        assert_eq!(disk.attempt_count, 1);
        assert!(disk.raw_output.contains("disk full"));
        assert_eq!(entry.results[2].status, StepStatus::Success);
    }
    assert_eq!(harness.sessions.count("fio"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_output_fails_step_and_keeps_output() {
    let mut harness = Harness::new(FakeHypervisor::new(), ScriptedSessions::new(), suite());
    harness.parser = Arc::new(RejectingParser::new(["net"]));

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    let net = &report.entries[0].results[2];
    assert_eq!(net.status, StepStatus::Failed);
    assert_eq!(net.raw_output, "score: 1");
    assert_eq!(net.attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_errors_are_retried() {
    let sessions = ScriptedSessions::new().on(
        "iperf3",
        [
            Scripted::ConnectionLost,
            Scripted::ConnectionLost,
            Scripted::ok("bandwidth: 940 Mbits/sec"),
        ],
    );
    let harness = Harness::new(FakeHypervisor::new(), sessions, suite());

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    let net = &report.entries[0].results[2];
    assert_eq!(net.status, StepStatus::Success);
    assert_eq!(net.attempt_count, 3);
    assert_eq!(net.metrics.get("bandwidth"), Some(&940.0));
    assert_eq!(report.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_step_times_out_after_budget() {
    let sessions = ScriptedSessions::new().on("fio", [Scripted::Hang]);
    let harness = Harness::new(FakeHypervisor::new(), sessions, suite());

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    let disk = &report.entries[0].results[1];
    assert_eq!(disk.status, StepStatus::TimedOut);
    assert_eq!(disk.attempt_count, 3);
    // Three 60s attempts plus two backoffs
    assert!(disk.duration() >= Duration::from_secs(190));
    assert_eq!(report.entries[0].results[2].status, StepStatus::Success);
    assert!(harness.hypervisor.live_domains().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_provision_failure_is_isolated() {
    let hypervisor = FakeHypervisor::new().fail_define("medium");
    let harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());

    let report = harness.coordinator().execute(&matrix()).await;

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.len(), 3);

    let medium = report.get("medium").unwrap();
    assert!(!medium.reached_ready);
    assert_eq!(medium.final_state, LifecycleState::Destroyed);
    assert!(medium.error.as_deref().unwrap().contains("provisioning 'medium' failed"));
    assert_eq!(medium.results.len(), 3);
    assert!(medium.results.iter().all(|r| r.status == StepStatus::Skipped));

    for id in ["small", "large"] {
        assert!(report.get(id).unwrap().is_success(), "{id} should succeed");
    }
    assert!(harness.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_still_removes_domain() {
    let hypervisor = FakeHypervisor::new().fail_start("small");
    let harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    let small = report.get("small").unwrap();
    assert!(!small.reached_ready);
    assert_eq!(small.final_state, LifecycleState::Destroyed);
    assert_eq!(harness.hypervisor.defined_total(), 1);
    assert!(harness.hypervisor.live_domains().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_skips_steps_and_tears_down() {
    let hypervisor = FakeHypervisor::new().never_ready("large");
    let harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());

    let report = harness.coordinator().execute(&matrix()).await;

    let large = report.get("large").unwrap();
    assert!(!large.reached_ready);
    assert_eq!(large.final_state, LifecycleState::Destroyed);
    assert!(large.error.as_deref().unwrap().contains("not reachable"));
    assert!(large.results.iter().all(|r| r.status == StepStatus::Skipped));

    // No benchmark command ever reached the unready guest
    assert_eq!(harness.sessions.count("sysbench"), 2);
    assert!(harness.hypervisor.live_domains().is_empty());
    assert_eq!(report.status, RunStatus::CompletedWithFailures);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_waits_for_sessions() {
    let sessions = ScriptedSessions::new().refuse_opens(3);
    let harness = Harness::new(FakeHypervisor::new(), sessions, suite());

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    assert!(report.get("small").unwrap().is_success());
    // Three refused probes, one accepted probe, one session per step
    assert_eq!(harness.sessions.opens(), 3 + 1 + 3);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_command_must_succeed() {
    let sessions = ScriptedSessions::new().on(
        "cloud-init status",
        [Scripted::exit(1, "status: running"), Scripted::ok("status: done")],
    );
    let mut harness = Harness::new(FakeHypervisor::new(), sessions, suite());
    harness.policy.readiness_command = Some("cloud-init status --wait".to_string());

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    assert!(report.get("small").unwrap().is_success());
    assert_eq!(harness.sessions.count("cloud-init"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_teardown_is_reported() {
    let hypervisor = FakeHypervisor::new().fail_stop("small", u32::MAX);
    let harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());

    let report = harness.coordinator().execute(&matrix()).await;

    let small = report.get("small").unwrap();
    assert_eq!(small.final_state, LifecycleState::Abandoned);
    // Benchmarks ran before teardown; results survive abandonment
    assert!(small.is_success());

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].vm_spec_id, "small");
    assert!(report.warnings[0].message.contains("abandoned after 3 attempts"));

    let domain = small.domain.clone().unwrap();
    let stops = harness
        .hypervisor
        .calls_for(&domain)
        .into_iter()
        .filter(|c| matches!(c, HypervisorCall::Stop(_)))
        .count();
    assert_eq!(stops, 3);
    assert_eq!(harness.hypervisor.live_domains(), [domain]);
    // Abandoned instances leave the registry too
    assert!(harness.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_teardown_failure_recovers() {
    let hypervisor = FakeHypervisor::new().fail_stop("small", 2);
    let harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());

    let report = harness.coordinator().execute(&[spec("small", 1)]).await;

    assert_eq!(report.get("small").unwrap().final_state, LifecycleState::Destroyed);
    assert!(report.warnings.is_empty());
    assert!(harness.hypervisor.live_domains().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bounds_live_domains() {
    let hypervisor = FakeHypervisor::new().with_define_delay(Duration::from_secs(2));
    let sessions = ScriptedSessions::new().with_default(Scripted::after(
        Duration::from_secs(10),
        Scripted::ok("score: 1"),
    ));
    let mut harness = Harness::new(hypervisor, sessions, suite());
    harness.settings.concurrency = 2;

    let specs = vec![spec("a", 1), spec("b", 1), spec("c", 2), spec("d", 2), spec("e", 4)];
    let report = harness.coordinator().execute(&specs).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.entries.iter().map(|e| e.vm_spec_id.clone()).collect::<Vec<_>>(),
        ids(&specs)
    );
    assert_eq!(harness.hypervisor.peak_live(), 2);
    assert_eq!(harness.hypervisor.defined_total(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_tears_down_and_marks_unstarted() {
    let sessions = ScriptedSessions::new().on("sysbench", [Scripted::Hang]);
    let mut harness = Harness::new(FakeHypervisor::new(), sessions, suite());
    harness.settings.concurrency = 1;
    harness.settings.run_deadline = Some(Duration::from_secs(90));

    let report = harness.coordinator().execute(&matrix()).await;

    assert_eq!(report.status, RunStatus::DeadlineExceeded);
    assert_eq!(report.len(), 3);

    // The step in flight at the deadline finishes its attempt, then stops retrying
    let small = report.get("small").unwrap();
    assert!(small.reached_ready);
    assert_eq!(small.final_state, LifecycleState::Destroyed);
    assert_eq!(small.results[0].status, StepStatus::TimedOut);
    assert_eq!(small.results[0].attempt_count, 2);
    assert_eq!(small.results[1].status, StepStatus::Skipped);
    assert_eq!(small.results[2].status, StepStatus::Skipped);

    for id in ["medium", "large"] {
        let entry = report.get(id).unwrap();
        assert_eq!(entry.final_state, LifecycleState::Requested);
        assert!(entry.results.iter().all(|r| r.status == StepStatus::Skipped));
        assert_eq!(entry.error.as_deref(), Some("run deadline exceeded before start"));
    }

    assert_eq!(harness.hypervisor.defined_total(), 1);
    assert!(harness.hypervisor.live_domains().is_empty());
    assert!(harness.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_suite_skips_remaining_steps() {
    let sessions = ScriptedSessions::new().on(
        "sysbench",
        [Scripted::after(Duration::from_secs(30), Scripted::ok("score: 7"))],
    );
    let mut harness = Harness::new(FakeHypervisor::new(), sessions, suite());
    harness.settings.concurrency = 1;
    let coordinator = harness.coordinator();

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    });

    let report = coordinator.execute(&matrix()).await;

    assert_eq!(report.status, RunStatus::Cancelled);
    let small = report.get("small").unwrap();
    assert_eq!(small.results[0].status, StepStatus::Success);
    assert_eq!(small.results[0].metrics.get("score"), Some(&7.0));
    assert_eq!(small.results[1].status, StepStatus::Skipped);
    assert_eq!(small.results[2].status, StepStatus::Skipped);
    assert_eq!(
        report.get("large").unwrap().error.as_deref(),
        Some("run cancelled before start")
    );
    assert!(harness.hypervisor.live_domains().is_empty());
    assert!(harness.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_readiness() {
    let hypervisor = FakeHypervisor::new().never_ready("small");
    let harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());
    let coordinator = harness.coordinator();

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let report = coordinator.execute(&[spec("small", 1)]).await;

    assert_eq!(report.status, RunStatus::Cancelled);
    let small = report.get("small").unwrap();
    assert!(!small.reached_ready);
    assert!(small.error.as_deref().unwrap().contains("cancelled"));
    assert_eq!(small.final_state, LifecycleState::Destroyed);
    assert!(harness.hypervisor.live_domains().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_provisioning() {
    let hypervisor = FakeHypervisor::new().with_define_delay(Duration::from_secs(10));
    let mut harness = Harness::new(hypervisor, ScriptedSessions::new(), suite());
    harness.settings.concurrency = 2;
    let coordinator = harness.coordinator();

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let report = coordinator.execute(&matrix()).await;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.len(), 3);
    for id in ["small", "medium"] {
        let entry = report.get(id).unwrap();
        assert!(!entry.reached_ready, "{id} never became ready");
        assert_eq!(entry.final_state, LifecycleState::Destroyed);
        assert!(entry.error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(entry.results.len(), 3);
        assert!(entry.results.iter().all(|r| r.status == StepStatus::Skipped));
    }
    let large = report.get("large").unwrap();
    assert_eq!(large.final_state, LifecycleState::Requested);
    assert_eq!(large.error.as_deref(), Some("run cancelled before start"));

    assert_eq!(harness.hypervisor.defined_total(), 2);
    assert!(harness.hypervisor.live_domains().is_empty());
    assert!(harness.registry().is_empty());
    assert_eq!(harness.sessions.count("sysbench"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_report_serializes_records() {
    let harness = Harness::new(FakeHypervisor::new(), ScriptedSessions::new(), suite());
    let report = harness.coordinator().execute(&matrix()).await;

    let json = kvm_bench_coordinator::orchestrator::results::results_json(&report);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["success"], true);
    assert_eq!(json["records"].as_array().unwrap().len(), 9);
    assert_eq!(json["records"][0]["vm_spec_id"], "small");
    assert_eq!(json["records"][0]["benchmark_name"], "cpu");
    assert_eq!(json["run_id"], harness.settings.run_id.as_str());
}
