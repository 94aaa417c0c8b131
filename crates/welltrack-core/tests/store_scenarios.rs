use welltrack_core::{ItemStateStore, ItemStatus, MergeOutcome, SessionKey};
use welltrack_protocol::{ItemId, ProtocolEvent, StreamParser};

fn run_stream(store: &mut ItemStateStore, stream: &str) -> Vec<ProtocolEvent> {
    let mut parser = StreamParser::default();
    let mut events = parser.feed(stream.as_bytes());
    events.extend(parser.finish());
    for event in &events {
        store.apply_event(event, None);
    }
    events
}

fn store() -> ItemStateStore {
    ItemStateStore::new(SessionKey::new("plate-7"), "/data/plate-7")
}

#[test]
fn full_batch_classifies_each_item_from_its_payload() {
    let mut store = store();
    run_stream(
        &mut store,
        concat!(
            "TOTAL_FILES:2\n",
            "WELL_COMPLETED:{\"id\":\"A01\",\"measurementCount\":500,\"hasData\":true}\n",
            "WELL_COMPLETED:{\"id\":\"B01\",\"measurementCount\":50,\"hasData\":true}\n",
            "ANALYSIS_COMPLETE:\n",
        ),
    );

    let session = store.session();
    assert_eq!(session.items.len(), 2);
    assert_eq!(
        session.item(&ItemId::new("A01")).map(|record| record.status),
        Some(ItemStatus::Normal)
    );
    assert_eq!(
        session.item(&ItemId::new("B01")).map(|record| record.status),
        Some(ItemStatus::Warning)
    );
    assert_eq!(session.progress.expected, Some(2));
    assert!(session.progress.finished);
}

#[test]
fn malformed_line_is_reported_and_the_stream_continues() {
    let mut store = store();
    let events = run_stream(
        &mut store,
        concat!(
            "WELL_COMPLETED:{not valid json\n",
            "WELL_COMPLETED:{\"id\":\"A01\",\"measurementCount\":500,\"hasData\":true}\n",
        ),
    );

    let malformed = events
        .iter()
        .filter(|event| matches!(event, ProtocolEvent::Malformed(_)))
        .count();
    let summaries = events
        .iter()
        .filter(|event| matches!(event, ProtocolEvent::ItemSummary(_)))
        .count();
    assert_eq!((malformed, summaries), (1, 1));
    assert_eq!(store.len(), 1);
}

#[test]
fn replaying_a_summary_leaves_the_store_unchanged() {
    let mut store = store();
    let line = "WELL_COMPLETED:{\"id\":\"C03\",\"measurementCount\":250,\"hasData\":true}\n";
    run_stream(&mut store, line);
    let once = store.snapshot();

    let events = run_stream(&mut store, line);
    let ProtocolEvent::ItemSummary(summary) = &events[0] else {
        panic!("expected a summary, got {:?}", events[0]);
    };
    assert_eq!(store.merge_summary(summary), MergeOutcome::Unchanged);
    assert_eq!(store.snapshot(), once);
}

#[test]
fn full_result_outranks_the_earlier_summary() {
    let mut store = store();
    run_stream(
        &mut store,
        concat!(
            "WELL_COMPLETED:{\"id\":\"D04\",\"measurementCount\":900,\"hasData\":true}\n",
            "UPDATED_RESULT:{\"id\":\"D04\",\"measurementCount\":900,\"hasData\":true,\"deviationDetected\":\"yes\"}\n",
        ),
    );

    let record = store.session().item(&ItemId::new("D04")).expect("D04 record");
    assert_eq!(record.status, ItemStatus::Deviation);
    assert!(store.session().full_results.contains_key(&ItemId::new("D04")));
}
