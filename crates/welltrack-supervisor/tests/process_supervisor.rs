#![cfg(unix)]

use std::time::Duration;

use welltrack_protocol::{ItemId, ProtocolEvent};
use welltrack_supervisor::{
    InvocationMessage, InvocationRequest, InvocationScope, ProcessSupervisor, SupervisorConfig,
    SupervisorError, WorkerCommand,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fake_worker(script: &str) -> ProcessSupervisor {
    ProcessSupervisor::new(WorkerCommand::new("sh").with_base_args(["-c", script, "fake-worker"]))
}

fn item(id: &str) -> InvocationScope {
    InvocationScope::Item(ItemId::new(id))
}

fn request(scope: InvocationScope) -> InvocationRequest {
    InvocationRequest::new(scope, std::env::temp_dir())
}

#[tokio::test]
async fn streams_events_in_order_and_reports_success() {
    let supervisor = fake_worker(
        r#"printf 'TOTAL_FILES:2\n'
printf 'WELL_COMPLETED:{"id":"A01","measurementCount":500,"hasData":true}\n'
printf 'PROGRESS:1/2\n'
printf 'WELL_COMPLETED:{"id":"B01","measurementCount":50,"hasData":true}\n'
printf 'ANALYSIS_COMPLETE:done'"#,
    );

    let running = supervisor
        .launch(request(InvocationScope::Batch))
        .expect("launch fake worker");
    let (events, report) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
        .await
        .expect("worker should finish");
    let report = report.expect("exit report");

    assert_eq!(report.outcome, Ok(()));
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.parser_stats.lines, 5);
    assert_eq!(events.len(), 5);
    assert_eq!(events[0], ProtocolEvent::BatchSize(2));
    let ProtocolEvent::ItemSummary(first) = &events[1] else {
        panic!("expected summary, got {:?}", events[1]);
    };
    assert_eq!(first.id.as_str(), "A01");
    assert_eq!(
        events[4],
        ProtocolEvent::BatchFinished {
            message: "done".to_owned()
        }
    );
    assert!(!supervisor.is_in_flight(&InvocationScope::Batch));
}

#[tokio::test]
async fn passes_invocation_arguments_and_environment() {
    let supervisor = fake_worker(r#"printf 'DEBUG:%s %s\n' "$1" "$WELLTRACK_DEBUG""#);
    let mut request = request(item("C03"));
    request.args = vec!["--well".to_owned()];
    request.environment = vec![("WELLTRACK_DEBUG".to_owned(), "1".to_owned())];

    let running = supervisor.launch(request).expect("launch fake worker");
    let (events, _) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
        .await
        .expect("worker should finish");

    let [ProtocolEvent::Diagnostic(diagnostic)] = events.as_slice() else {
        panic!("expected one diagnostic, got {events:?}");
    };
    assert_eq!(diagnostic.message, "--well 1");
}

#[tokio::test]
async fn non_zero_exit_keeps_delivered_events_and_reports_stderr_tail() {
    let supervisor = fake_worker(
        r#"printf 'WELL_COMPLETED:{"id":"A01","measurementCount":500}\n'
echo 'loading template' >&2
echo 'template file not found' >&2
exit 3"#,
    );

    let running = supervisor
        .launch(request(InvocationScope::Batch))
        .expect("launch fake worker");
    let (events, report) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
        .await
        .expect("worker should finish");
    let report = report.expect("exit report");

    assert_eq!(events.len(), 1);
    assert_eq!(report.exit_code, Some(3));
    assert_eq!(
        report.outcome,
        Err(SupervisorError::NonZeroExit {
            code: Some(3),
            detail: "loading template\ntemplate file not found".to_owned(),
        })
    );
}

#[tokio::test]
async fn missing_binary_is_a_launch_failure_and_frees_the_scope() {
    let supervisor = ProcessSupervisor::new(WorkerCommand::new(
        "/nonexistent/welltrack-worker-for-tests",
    ));

    let error = supervisor
        .launch(request(item("A01")))
        .expect_err("launch should fail");
    assert!(matches!(error, SupervisorError::LaunchFailure { .. }));
    assert!(!supervisor.is_in_flight(&item("A01")));

    let again = supervisor
        .launch(request(item("A01")))
        .expect_err("launch should fail again");
    assert!(matches!(again, SupervisorError::LaunchFailure { .. }));
}

#[tokio::test]
async fn same_item_is_rejected_while_other_items_run() {
    let supervisor = fake_worker("exec sleep 5");

    let first = supervisor.launch(request(item("B01"))).expect("first launch");
    let duplicate = supervisor
        .launch(request(item("B01")))
        .expect_err("duplicate should be rejected");
    assert_eq!(duplicate, SupervisorError::InFlight(item("B01")));

    let sibling = supervisor.launch(request(item("A01"))).expect("sibling launch");
    let batch = supervisor
        .launch(request(InvocationScope::Batch))
        .expect("batch launch");
    let second_batch = supervisor
        .launch(request(InvocationScope::Batch))
        .expect_err("second batch should be rejected");
    assert_eq!(second_batch, SupervisorError::InFlight(InvocationScope::Batch));

    assert_eq!(supervisor.cancel_all(), 3);
    for running in [first, sibling, batch] {
        let (_, report) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
            .await
            .expect("cancelled worker should exit");
        assert_eq!(report.expect("exit report").outcome, Err(SupervisorError::Cancelled));
    }
    assert!(supervisor.in_flight().is_empty());
}

#[tokio::test]
async fn timeout_stops_the_worker_and_is_distinct_from_exit_failure() {
    let supervisor = fake_worker(
        r#"printf 'WELL_COMPLETED:{"id":"D04","measurementCount":200}\n'
exec sleep 5"#,
    );
    let mut request = request(item("D04"));
    request.timeout = Some(Duration::from_millis(300));

    let running = supervisor.launch(request).expect("launch fake worker");
    let (events, report) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
        .await
        .expect("timed out worker should exit");

    assert_eq!(events.len(), 1);
    assert_eq!(
        report.expect("exit report").outcome,
        Err(SupervisorError::Timeout(Duration::from_millis(300)))
    );
    assert!(!supervisor.is_in_flight(&item("D04")));
}

#[tokio::test]
async fn cancel_stops_delivery_and_releases_scope() {
    let supervisor = fake_worker(
        r#"printf 'TOTAL_FILES:96\n'
sleep 1
printf 'WELL_COMPLETED:{"id":"A01"}\n'
exec sleep 5"#,
    );

    let mut running = supervisor
        .launch(request(InvocationScope::Batch))
        .expect("launch fake worker");
    let first = tokio::time::timeout(TEST_TIMEOUT, running.next_message())
        .await
        .expect("first event");
    assert_eq!(
        first,
        Some(InvocationMessage::Event(ProtocolEvent::BatchSize(96)))
    );

    assert!(supervisor.cancel(&InvocationScope::Batch));
    let (events, report) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
        .await
        .expect("cancelled worker should exit");

    assert!(events.is_empty());
    assert_eq!(report.expect("exit report").outcome, Err(SupervisorError::Cancelled));
    assert!(!supervisor.is_in_flight(&InvocationScope::Batch));
}

#[tokio::test]
async fn line_split_across_writes_is_reassembled() {
    let supervisor = fake_worker(
        r#"printf 'TOTAL_'
sleep 0.2
printf 'FILES:3\n'"#,
    );

    let running = supervisor
        .launch(request(InvocationScope::Batch))
        .expect("launch fake worker");
    let (events, report) = tokio::time::timeout(TEST_TIMEOUT, running.collect())
        .await
        .expect("worker should finish");

    assert_eq!(events, vec![ProtocolEvent::BatchSize(3)]);
    assert_eq!(report.expect("exit report").outcome, Ok(()));
}

#[tokio::test]
async fn exit_is_reported_when_a_descendant_keeps_the_output_open() {
    let supervisor = ProcessSupervisor::with_config(
        WorkerCommand::new("sh").with_base_args([
            "-c",
            "printf 'TOTAL_FILES:1\\n'; sleep 30 & exit 0",
            "fake-worker",
        ]),
        SupervisorConfig {
            reader_drain_grace: Duration::from_millis(200),
            ..SupervisorConfig::default()
        },
    );

    let running = supervisor
        .launch(request(InvocationScope::Batch))
        .expect("launch fake worker");
    let (events, report) = tokio::time::timeout(Duration::from_secs(5), running.collect())
        .await
        .expect("exit must not wait for the orphaned descendant");
    let report = report.expect("exit report");

    assert_eq!(report.outcome, Ok(()));
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(events, vec![ProtocolEvent::BatchSize(1)]);
    assert!(!supervisor.is_in_flight(&InvocationScope::Batch));
}
