//! Worker wire protocol for the analysis worker.
//!
//! The worker reports progress on its primary output stream as newline
//! terminated `TAG` or `TAG:PAYLOAD` lines. This crate owns the tag table,
//! the typed per-item payloads, and the incremental parser that turns raw
//! byte chunks into [`ProtocolEvent`]s.

pub mod error;
pub mod event;
pub mod ids;
pub mod parser;
pub mod payload;
pub mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    DiagnosticEvent, DiagnosticSource, MalformedEvent, ProgressEvent, ProtocolEvent,
};
pub use ids::ItemId;
pub use parser::{StreamParser, StreamParserStats};
pub use payload::{PassThroughFields, ResultPayload};
pub use wire::WireTag;

#[cfg(test)]
mod tests {
    use super::{ItemId, ProtocolEvent, ResultPayload, StreamParser};

    #[test]
    fn item_id_round_trips_as_json_string() {
        let item_id = ItemId::new("A01");
        let serialized = serde_json::to_string(&item_id).expect("serialize item id");
        let deserialized: ItemId =
            serde_json::from_str(&serialized).expect("deserialize item id");

        assert_eq!(serialized, "\"A01\"");
        assert_eq!(deserialized, item_id);
    }

    #[test]
    fn summary_line_carries_typed_fields() {
        let mut parser = StreamParser::default();
        let events = parser.feed(
            br#"WELL_COMPLETED:{"id":"A01","displayName":"NTC","measurementCount":500,"hasData":true}
"#,
        );

        let [ProtocolEvent::ItemSummary(summary)] = events.as_slice() else {
            panic!("expected one summary event, got {events:?}");
        };
        assert_eq!(
            summary,
            &ResultPayload {
                display_name: Some("NTC".to_owned()),
                measurement_count: Some(500),
                has_data: Some(true),
                ..ResultPayload::new("A01")
            }
        );
    }
}
