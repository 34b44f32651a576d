use serde_json::Value;

use refinery_core::types::ChatMessage;

use crate::state::WorkflowState;

/// Longest rendering of a single state value inside a prompt.
const MAX_VALUE_CHARS: usize = 6000;

/// A piece of state rendered into a node's prompt.
#[derive(Debug, Clone)]
pub enum ContextSource {
    /// The whole field under a heading.
    Field { field: String, label: String },
    /// Entries of a map field, optionally restricted to `keys`.
    Entries {
        field: String,
        label: String,
        keys: Option<Vec<String>>,
    },
}

impl ContextSource {
    pub fn field(field: &str, label: &str) -> Self {
        ContextSource::Field {
            field: field.into(),
            label: label.into(),
        }
    }

    pub fn entries(field: &str, label: &str, keys: Option<Vec<String>>) -> Self {
        ContextSource::Entries {
            field: field.into(),
            label: label.into(),
            keys,
        }
    }

    pub fn field_name(&self) -> &str {
        match self {
            ContextSource::Field { field, .. } | ContextSource::Entries { field, .. } => field,
        }
    }

    fn render(&self, state: &WorkflowState) -> Option<String> {
        match self {
            ContextSource::Field { field, label } => {
                let value = state.get(field).filter(|v| !is_blank(v))?;
                Some(format!("## {}\n\n{}\n", label, render_value(value)))
            }
            ContextSource::Entries { field, label, keys } => {
                let map = state.get(field)?.as_object()?;
                let mut out = String::new();
                let selected: Vec<(&String, &Value)> = match keys {
                    Some(keys) => keys
                        .iter()
                        .filter_map(|k| map.get_key_value(k.as_str()))
                        .collect(),
                    None => map.iter().collect(),
                };
                for (key, value) in selected.into_iter().filter(|(_, v)| !is_blank(v)) {
                    out.push_str(&format!("### {}\n\n{}\n\n", key, render_value(value)));
                }
                if out.is_empty() {
                    None
                } else {
                    Some(format!("## {}\n\n{}", label, out))
                }
            }
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Strings as-is, everything else as pretty JSON, truncated.
pub fn render_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    truncate_chars(&text, MAX_VALUE_CHARS)
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n... (truncated)", &s[..idx]),
        None => s.to_string(),
    }
}

/// Render every available source, in order.
pub fn render_context(state: &WorkflowState, sources: &[ContextSource]) -> String {
    sources
        .iter()
        .filter_map(|s| s.render(state))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `[system(instructions), user(context + task)]`.
pub fn build_messages(instructions: &str, context: &str, task: &str) -> Vec<ChatMessage> {
    let mut user = String::new();
    if !context.trim().is_empty() {
        user.push_str(context.trim_end());
        user.push_str("\n\n---\n\n");
    }
    user.push_str(task);
    vec![ChatMessage::system(instructions), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MergePolicy, Partial, StateSchema};
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> WorkflowState {
        let schema = Arc::new(
            StateSchema::new()
                .field("file_name", MergePolicy::Overwrite, "")
                .field("analyses", MergePolicy::DictUnion, ""),
        );
        WorkflowState::with_input(
            schema,
            Partial::new()
                .set("file_name", "q3.txt")
                .set("analyses", json!({"a": "alpha", "b": "beta", "c": ""})),
        )
    }

    #[test]
    fn test_render_field_and_entries() {
        let s = state();
        let text = render_context(
            &s,
            &[
                ContextSource::field("file_name", "Document"),
                ContextSource::entries("analyses", "Analyses", Some(vec!["b".into(), "c".into()])),
                ContextSource::field("missing", "Nothing"),
            ],
        );
        assert!(text.contains("## Document\n\nq3.txt"));
        assert!(text.contains("### b\n\nbeta"));
        assert!(!text.contains("alpha"));
        assert!(!text.contains("### c"));
        assert!(!text.contains("Nothing"));
    }

    #[test]
    fn test_build_messages() {
        let m = build_messages("be precise", "## Ctx\n\nx\n", "Do it.");
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].content, "be precise");
        assert!(m[1].content.starts_with("## Ctx"));
        assert!(m[1].content.ends_with("Do it."));

        let m = build_messages("s", "", "Task only.");
        assert_eq!(m[1].content, "Task only.");
    }

    #[test]
    fn test_render_value_truncates() {
        let long = Value::String("x".repeat(MAX_VALUE_CHARS + 10));
        assert!(render_value(&long).ends_with("(truncated)"));
        assert_eq!(render_value(&json!(3)), "3");
    }
}
