use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};

use runrelay_core::{DomainError, DomainResult, Step};
use runrelay_infra::FailAtOverride;

// ─────────────────────────────────────────────────────────────────────────────
// Request DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default = "default_workflow")]
    pub workflow: String,
    #[serde(default)]
    pub input: Option<JsonValue>,
    #[serde(default)]
    pub fail_at: Option<String>,
}

impl Default for CreateRunRequest {
    fn default() -> Self {
        Self {
            workflow: default_workflow(),
            input: None,
            fail_at: None,
        }
    }
}

/// Validated create request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub workflow: String,
    pub input: JsonValue,
    pub fail_at: Option<Step>,
}

impl CreateRunRequest {
    pub fn validate(self) -> DomainResult<NewRun> {
        let workflow = self.workflow.trim();
        if workflow.is_empty() {
            return Err(DomainError::validation("workflow must not be empty"));
        }

        let input = match self.input {
            None | Some(JsonValue::Null) => JsonValue::Object(Map::new()),
            Some(value @ JsonValue::Object(_)) => value,
            Some(_) => return Err(DomainError::validation("input must be a JSON object")),
        };

        Ok(NewRun {
            workflow: workflow.to_string(),
            input,
            fail_at: parse_step(self.fail_at.as_deref())?,
        })
    }
}

/// Replay body. `fail_at` distinguishes "absent" from an explicit `null`.
#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    #[serde(default, deserialize_with = "explicit_null")]
    pub fail_at: Option<Option<String>>,
}

impl ReplayRequest {
    pub fn fail_at_override(&self) -> DomainResult<FailAtOverride> {
        let explicit = match &self.fail_at {
            None => None,
            Some(value) => Some(parse_step(value.as_deref())?),
        };
        Ok(FailAtOverride::from_explicit(explicit))
    }
}

#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub event: Map<String, JsonValue>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an optional JSON body; an empty body or a bare `null` yields the default.
pub fn parse_optional_body<T>(body: &[u8]) -> DomainResult<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| DomainError::validation(format!("invalid JSON body: {e}")))?;
    if value.is_null() {
        return Ok(T::default());
    }
    parse_value(value)
}

/// Parse a required JSON body.
pub fn parse_body<T>(body: &[u8]) -> DomainResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| DomainError::validation(format!("invalid JSON body: {e}")))?;
    parse_value(value)
}

fn parse_value<T>(value: JsonValue) -> DomainResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(value).map_err(|e| DomainError::validation(e.to_string()))
}

fn parse_step(raw: Option<&str>) -> DomainResult<Option<Step>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(name) => name.parse().map(Some),
    }
}

fn default_workflow() -> String {
    "demo".to_string()
}

fn explicit_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}
