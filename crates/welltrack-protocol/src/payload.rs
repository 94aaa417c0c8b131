use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::ItemId;

/// Result fields the orchestration layer never interprets.
///
/// They are carried through untouched so the cache and exports keep
/// everything the worker reported. The bag can be read but not edited.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassThroughFields(Map<String, Value>);

impl PassThroughFields {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for PassThroughFields {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-item payload reported by the worker, either as an early summary or
/// as the complete result used for cache and export.
///
/// Only the fields status classification needs are typed; everything else
/// lands in [`PassThroughFields`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    #[serde(alias = "well", alias = "well_id", alias = "wellId")]
    pub id: ItemId,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "display_name",
        alias = "sampleName",
        alias = "sample_name"
    )]
    pub display_name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_count",
        alias = "measurement_count",
        alias = "dropletCount",
        alias = "droplet_count"
    )]
    pub measurement_count: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_truthy",
        alias = "has_data"
    )]
    pub has_data: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_error"
    )]
    pub error: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_truthy",
        alias = "requires_reclustering"
    )]
    pub requires_reclustering: bool,
    #[serde(
        default,
        deserialize_with = "deserialize_truthy",
        alias = "buffer_zone",
        alias = "inBufferZone",
        alias = "in_buffer_zone"
    )]
    pub buffer_zone: bool,
    #[serde(
        default,
        deserialize_with = "deserialize_truthy",
        alias = "deviation_detected"
    )]
    pub deviation_detected: bool,
    #[serde(flatten)]
    pub extra: PassThroughFields,
}

impl ResultPayload {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            measurement_count: None,
            has_data: None,
            error: None,
            requires_reclustering: false,
            buffer_zone: false,
            deviation_detected: false,
            extra: PassThroughFields::default(),
        }
    }

    /// True when the worker reported a non-blank per-item error.
    pub fn has_error(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|message| !message.trim().is_empty())
    }

    /// Parses a `WELL_COMPLETED` payload.
    pub fn from_summary_json(raw: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|error| ProtocolError::InvalidJson(error.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::UnexpectedShape(
                "summary payload must be a JSON object".to_owned(),
            ));
        }
        Self::from_value(value)
    }

    /// Parses an `UPDATED_RESULT` payload.
    ///
    /// The worker sends either an object carrying `id` or a single-key
    /// object `{"<id>": {...fields}}`.
    pub fn from_updated_result_json(raw: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|error| ProtocolError::InvalidJson(error.to_string()))?;
        Self::from_keyed_value(value)
    }

    /// Parses a `COMPLETE_RESULTS` payload.
    pub fn list_from_json(raw: &str) -> ProtocolResult<Vec<Self>> {
        let value: Value =
            serde_json::from_str(raw).map_err(|error| ProtocolError::InvalidJson(error.to_string()))?;
        match value {
            Value::Array(entries) => entries.into_iter().map(Self::from_keyed_value).collect(),
            Value::Object(map) if !has_identity_key(&map) => map
                .into_iter()
                .map(|(id, fields)| Self::from_value(with_identity(id, fields)?))
                .collect(),
            _ => Err(ProtocolError::UnexpectedShape(
                "complete results payload must be a JSON array".to_owned(),
            )),
        }
    }

    fn from_keyed_value(value: Value) -> ProtocolResult<Self> {
        let Value::Object(map) = value else {
            return Err(ProtocolError::UnexpectedShape(
                "result payload must be a JSON object".to_owned(),
            ));
        };
        if has_identity_key(&map) {
            return Self::from_value(Value::Object(map));
        }
        if map.len() == 1 {
            if let Some((id, fields)) = map.into_iter().next() {
                return Self::from_value(with_identity(id, fields)?);
            }
        }
        Err(ProtocolError::UnexpectedShape(
            "result payload carries no item id".to_owned(),
        ))
    }

    fn from_value(value: Value) -> ProtocolResult<Self> {
        serde_json::from_value(value)
            .map_err(|error| ProtocolError::UnexpectedShape(error.to_string()))
    }
}

const IDENTITY_KEYS: [&str; 4] = ["id", "well", "well_id", "wellId"];

fn has_identity_key(map: &Map<String, Value>) -> bool {
    IDENTITY_KEYS.iter().any(|key| map.contains_key(*key))
}

fn with_identity(id: String, fields: Value) -> ProtocolResult<Value> {
    let Value::Object(mut fields) = fields else {
        return Err(ProtocolError::UnexpectedShape(format!(
            "result fields for '{id}' must be a JSON object"
        )));
    };
    if !has_identity_key(&fields) {
        fields.insert("id".to_owned(), Value::String(id));
    }
    Ok(Value::Object(fields))
}

/// Loose truthiness used by the worker's flag fields.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "on" | "1"
        ),
        Value::Array(entries) => !entries.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}

fn deserialize_truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(is_truthy(&value))
}

fn deserialize_optional_truthy<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok((!value.is_null()).then(|| is_truthy(&value)))
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(number) => {
            if let Some(count) = number.as_u64() {
                return Ok(Some(count));
            }
            match number.as_f64() {
                Some(value) if value.is_finite() && value >= 0.0 => Ok(Some(value as u64)),
                _ => Err(de::Error::custom(format!(
                    "measurement count must be a non-negative number, got {number}"
                ))),
            }
        }
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("measurement count '{text}' is not a number"))),
        other => Err(de::Error::custom(format!(
            "measurement count must be a number, got {other}"
        ))),
    }
}

fn deserialize_error<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) => Some(message),
        other => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{is_truthy, ResultPayload};
    use crate::error::ProtocolError;

    #[test]
    fn flags_accept_loose_truthy_values() {
        let payload = ResultPayload::from_summary_json(
            r#"{"id":"A01","requires_reclustering":"yes","inBufferZone":1,"deviationDetected":0}"#,
        )
        .expect("parse flags");

        assert!(payload.requires_reclustering);
        assert!(payload.buffer_zone);
        assert!(!payload.deviation_detected);
    }

    #[test]
    fn unknown_fields_are_kept_in_pass_through_bag() {
        let payload = ResultPayload::from_summary_json(
            r#"{"id":"A01","concentration":12.5,"plotPath":"plots/A01.png"}"#,
        )
        .expect("parse payload");

        assert_eq!(payload.extra.len(), 2);
        assert_eq!(payload.extra.get("concentration"), Some(&json!(12.5)));

        let round_trip: ResultPayload =
            serde_json::from_str(&serde_json::to_string(&payload).expect("serialize payload"))
                .expect("deserialize payload");
        assert_eq!(round_trip, payload);
    }

    #[test]
    fn blank_error_is_not_an_error() {
        let payload =
            ResultPayload::from_summary_json(r#"{"id":"A01","error":"  "}"#).expect("parse");
        assert!(!payload.has_error());

        let payload =
            ResultPayload::from_summary_json(r#"{"id":"A01","error":"fit failed"}"#).expect("parse");
        assert!(payload.has_error());
    }

    #[test]
    fn updated_result_accepts_keyed_shape() {
        let payload = ResultPayload::from_updated_result_json(
            r#"{"B03":{"measurementCount":"1200","deviationDetected":true}}"#,
        )
        .expect("parse keyed result");

        assert_eq!(payload.id.as_str(), "B03");
        assert_eq!(payload.measurement_count, Some(1200));
        assert!(payload.deviation_detected);
    }

    #[test]
    fn updated_result_without_id_is_rejected() {
        let error = ResultPayload::from_updated_result_json(r#"{"a":1,"b":2}"#)
            .expect_err("payload without id");
        assert!(matches!(error, ProtocolError::UnexpectedShape(_)));
    }

    #[test]
    fn complete_results_parse_in_array_order() {
        let results = ResultPayload::list_from_json(
            r#"[{"id":"B01","measurementCount":10},{"id":"A01","measurementCount":900}]"#,
        )
        .expect("parse list");

        let ids: Vec<_> = results.iter().map(|payload| payload.id.as_str()).collect();
        assert_eq!(ids, vec!["B01", "A01"]);
    }

    #[test]
    fn truthiness_table() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("TRUE")));
        assert!(is_truthy(&json!(2)));
        assert!(!is_truthy(&json!("no")));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0.0)));
    }
}
