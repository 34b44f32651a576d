use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RefineryError, Result};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A role-tagged message sent to the generation oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    /// The same message with its timestamp cleared, for storing in workflow state.
    pub fn undated(mut self) -> Self {
        self.timestamp = None;
        self
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// JSON type of a structured-output field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Boolean,
    Number,
    Integer,
    Array,
    Object,
}

impl FieldType {
    fn json_name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// One named field of a structured output, with a one-line description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub kind: FieldType,
    pub description: String,
}

/// Declared shape of a structured oracle response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![],
        }
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        kind: FieldType,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            kind,
            description: description.into(),
        });
        self
    }

    /// `{code, explanation}`: an executable artifact and its rationale.
    pub fn artifact() -> Self {
        Self::new("artifact")
            .field("code", FieldType::String, "The generated code to execute.")
            .field(
                "explanation",
                FieldType::String,
                "Explanation of the approach taken.",
            )
    }

    /// `{should_continue, review}`: a critic's verdict.
    pub fn review() -> Self {
        Self::new("review")
            .field(
                "should_continue",
                FieldType::Boolean,
                "True if the work needs another refinement pass, false to stop.",
            )
            .field("review", FieldType::String, "Feedback from the reviewer.")
    }

    /// Render as a strict JSON Schema object.
    pub fn to_json_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    serde_json::json!({
                        "type": f.kind.json_name(),
                        "description": f.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Check that `value` is an object carrying every declared field with the declared type.
    pub fn validate(&self, value: &serde_json::Value) -> Result<()> {
        let obj = value.as_object().ok_or_else(|| self.violation("expected a JSON object"))?;
        for field in &self.fields {
            match obj.get(&field.name) {
                None => return Err(self.violation(format!("missing field '{}'", field.name))),
                Some(v) if !field.kind.accepts(v) => {
                    return Err(self.violation(format!(
                        "field '{}' is not of type {}",
                        field.name,
                        field.kind.json_name()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn violation(&self, message: impl Into<String>) -> RefineryError {
        RefineryError::SchemaValidation {
            schema: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Response from the generation oracle.
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    Text(String),
    /// An object already validated against the requested schema.
    Structured(serde_json::Value),
}

impl Generation {
    /// Text content; structured responses are rendered as compact JSON.
    pub fn text(&self) -> String {
        match self {
            Generation::Text(t) => t.clone(),
            Generation::Structured(v) => v.to_string(),
        }
    }

    /// String field of a structured response.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        match self {
            Generation::Structured(v) => v.get(name).and_then(|f| f.as_str()),
            Generation::Text(_) => None,
        }
    }

    /// Boolean field of a structured response.
    pub fn bool_field(&self, name: &str) -> Option<bool> {
        match self {
            Generation::Structured(v) => v.get(name).and_then(|f| f.as_bool()),
            Generation::Text(_) => None,
        }
    }
}

/// Named data bindings handed to the sandbox.
pub type Bindings = BTreeMap<String, serde_json::Value>;

/// One keyword-search record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_constructors() {
        let m = ChatMessage::system("be terse");
        assert_eq!(m.role, Role::System);
        assert_eq!(m.content, "be terse");
        assert!(m.timestamp.is_some());
        assert_eq!(ChatMessage::assistant("ok").role, Role::Assistant);
    }

    #[test]
    fn test_artifact_schema_validates() {
        let schema = OutputSchema::artifact();
        assert!(schema
            .validate(&json!({"code": "df = df", "explanation": "noop"}))
            .is_ok());

        let err = schema.validate(&json!({"code": "x"})).unwrap_err();
        assert!(err.to_string().contains("missing field 'explanation'"));

        let err = schema
            .validate(&json!({"code": 1, "explanation": "bad"}))
            .unwrap_err();
        assert!(err.to_string().contains("'code' is not of type string"));

        assert!(schema.validate(&json!("just text")).is_err());
    }

    #[test]
    fn test_json_schema_is_strict() {
        let js = OutputSchema::review().to_json_schema();
        assert_eq!(js["additionalProperties"], json!(false));
        assert_eq!(js["required"], json!(["should_continue", "review"]));
        assert_eq!(js["properties"]["should_continue"]["type"], json!("boolean"));
    }

    #[test]
    fn test_generation_accessors() {
        let g = Generation::Structured(json!({"should_continue": true, "review": "more"}));
        assert_eq!(g.bool_field("should_continue"), Some(true));
        assert_eq!(g.str_field("review"), Some("more"));
        assert_eq!(Generation::Text("hi".into()).str_field("review"), None);
        assert_eq!(Generation::Text("hi".into()).text(), "hi");
    }

    #[test]
    fn test_search_hit_serde() {
        let hit: SearchHit =
            serde_json::from_value(json!({"title": "t", "link": "l", "snippet": "s"})).unwrap();
        assert_eq!(hit.link, "l");
    }
}
