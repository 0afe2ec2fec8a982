use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::error::ToolError;

/// Envelope returned by every tool call.
///
/// All four keys are always present; `data` and `metadata` are `null` on
/// failure and `errors` is empty on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub metadata: Option<Value>,
    pub errors: Vec<String>,
}

impl ToolResponse {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            metadata: None,
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::failure(vec![message.into()])
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            metadata: None,
            errors,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Record processing time in the metadata object, if there is one.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        if let Some(Value::Object(map)) = self.metadata.as_mut() {
            map.insert("duration_ms".to_string(), Value::from(duration_ms));
        }
        self
    }

    /// The envelope as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "success": false,
                "data": null,
                "metadata": null,
                "errors": ["failed to serialize tool response"],
            })
        })
    }
}

/// Metadata attached to successful tool output.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub circuit_name: Option<String>,
    pub analysis_type: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metadata {
    pub fn new(analysis_type: &'static str, circuit_name: Option<String>) -> Self {
        Self {
            circuit_name,
            analysis_type,
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Typed result of a tool, converted into the untyped envelope at the edge.
#[derive(Debug, Clone)]
pub struct ToolOutput<T> {
    pub data: T,
    pub metadata: Metadata,
}

impl<T: Serialize> ToolOutput<T> {
    pub fn new(data: T, metadata: Metadata) -> Self {
        Self { data, metadata }
    }

    pub fn into_response(self) -> Result<ToolResponse, ToolError> {
        let data = serde_json::to_value(&self.data)?;
        let metadata = serde_json::to_value(&self.metadata)?;
        Ok(ToolResponse::success(data).with_metadata(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_has_all_keys() {
        let value = ToolResponse::success(json!({"x": 1})).to_value();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert_eq!(obj["success"], json!(true));
        assert_eq!(obj["errors"], json!([]));
        assert!(obj["metadata"].is_null());
    }

    #[test]
    fn test_error_envelope() {
        let value = ToolResponse::error("boom").to_value();
        assert_eq!(value["success"], json!(false));
        assert!(value["data"].is_null());
        assert_eq!(value["errors"], json!(["boom"]));
    }

    #[test]
    fn test_metadata_flattens_extra_keys() {
        let output = ToolOutput::new(
            json!({}),
            Metadata::new("power_flow", Some("IEEE13".into())).with("dpi", 150),
        );
        let response = output.into_response().unwrap().with_duration(12);
        let meta = response.metadata.unwrap();
        assert_eq!(meta["analysis_type"], json!("power_flow"));
        assert_eq!(meta["circuit_name"], json!("IEEE13"));
        assert_eq!(meta["dpi"], json!(150));
        assert_eq!(meta["duration_ms"], json!(12));
        assert!(meta["timestamp"].is_string());
    }

    #[test]
    fn test_duration_ignored_without_metadata() {
        let response = ToolResponse::error("x").with_duration(5);
        assert!(response.metadata.is_none());
    }
}
