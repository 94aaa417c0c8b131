use serde::{Deserialize, Serialize};
use welltrack_protocol::ResultPayload;

/// Measurement counts below this are too sparse to trust.
pub const LOW_DATA_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Normal,
    BufferZone,
    Deviation,
    Warning,
}

impl ItemStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::BufferZone => "buffer zone",
            Self::Deviation => "deviation",
            Self::Warning => "warning",
        }
    }
}

/// Derives an item's status from the latest payload merged for it.
///
/// Rules are checked in priority order and the first match wins, so an
/// errored item is a warning even when it also reports a deviation.
pub fn classify(payload: &ResultPayload) -> ItemStatus {
    if payload.has_error() {
        return ItemStatus::Warning;
    }
    if payload
        .measurement_count
        .is_some_and(|count| count < LOW_DATA_THRESHOLD)
    {
        return ItemStatus::Warning;
    }
    if payload.requires_reclustering {
        return ItemStatus::Warning;
    }
    if payload.buffer_zone {
        return ItemStatus::BufferZone;
    }
    if payload.deviation_detected {
        return ItemStatus::Deviation;
    }
    ItemStatus::Normal
}

#[cfg(test)]
mod tests {
    use welltrack_protocol::ResultPayload;

    use super::{classify, ItemStatus};

    #[test]
    fn error_outranks_deviation() {
        let payload = ResultPayload {
            error: Some("x".to_owned()),
            deviation_detected: true,
            ..ResultPayload::new("A01")
        };
        assert_eq!(classify(&payload), ItemStatus::Warning);
    }

    #[test]
    fn low_count_is_a_warning_but_missing_count_is_not() {
        let sparse = ResultPayload {
            measurement_count: Some(99),
            ..ResultPayload::new("A01")
        };
        let threshold = ResultPayload {
            measurement_count: Some(100),
            ..ResultPayload::new("A01")
        };
        assert_eq!(classify(&sparse), ItemStatus::Warning);
        assert_eq!(classify(&threshold), ItemStatus::Normal);
        assert_eq!(classify(&ResultPayload::new("A01")), ItemStatus::Normal);
    }

    #[test]
    fn reclustering_outranks_buffer_zone_which_outranks_deviation() {
        let mut payload = ResultPayload {
            measurement_count: Some(5000),
            requires_reclustering: true,
            buffer_zone: true,
            deviation_detected: true,
            ..ResultPayload::new("C02")
        };
        assert_eq!(classify(&payload), ItemStatus::Warning);

        payload.requires_reclustering = false;
        assert_eq!(classify(&payload), ItemStatus::BufferZone);

        payload.buffer_zone = false;
        assert_eq!(classify(&payload), ItemStatus::Deviation);
    }
}
