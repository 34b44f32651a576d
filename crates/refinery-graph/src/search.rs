use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use refinery_core::traits::SearchOracle;

use crate::graph::Node;
use crate::state::{Partial, WorkflowState};

/// Node name → hits returned for its query.
pub const SEARCH_RESULTS: &str = "search_results";

/// Runs one keyword search and stores the hits under its own name.
///
/// The query is the node's fixed prefix followed by the text of
/// `query_field`, cut to a reasonable length. An unavailable backend
/// yields an empty hit list.
pub struct SearchNode {
    name: String,
    prefix: String,
    query_field: Option<String>,
    oracle: Arc<dyn SearchOracle>,
}

const MAX_QUERY_CHARS: usize = 200;

impl SearchNode {
    pub fn new(name: impl Into<String>, oracle: Arc<dyn SearchOracle>) -> Self {
        Self {
            name: name.into(),
            prefix: String::new(),
            query_field: None,
            oracle,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn query_from(mut self, field: &str) -> Self {
        self.query_field = Some(field.to_string());
        self
    }

    fn query(&self, state: &WorkflowState) -> String {
        let subject = self
            .query_field
            .as_deref()
            .and_then(|f| state.get_str(f))
            .unwrap_or_default();
        let query = format!("{} {}", self.prefix, subject.split_whitespace().collect::<Vec<_>>().join(" "));
        query.trim().chars().take(MAX_QUERY_CHARS).collect()
    }
}

impl Node for SearchNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        self.query_field.iter().cloned().collect()
    }

    fn outputs(&self) -> Vec<String> {
        vec![SEARCH_RESULTS.into()]
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let query = self.query(state);
            let hits = self.oracle.search(&query).await;
            info!(node = %self.name, hits = hits.len(), "Search complete");
            Partial::new().entry(
                SEARCH_RESULTS,
                &self.name,
                serde_json::to_value(&hits).unwrap_or_default(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MergePolicy, StateSchema};
    use refinery_test_utils::{hit, StaticSearch};
    use serde_json::json;

    fn state() -> WorkflowState {
        let schema = Arc::new(
            StateSchema::new()
                .field("file_name", MergePolicy::Overwrite, "")
                .field(SEARCH_RESULTS, MergePolicy::DictUnion, ""),
        );
        WorkflowState::with_input(schema, Partial::new().set("file_name", "acme  q3\nreport.txt"))
    }

    #[tokio::test]
    async fn test_hits_stored_under_node_name() {
        let search = StaticSearch::new(vec![hit("Acme Q3", "https://acme.test/q3", "Revenue up")]);
        let queries = search.query_log();
        let node = SearchNode::new("web_search", Arc::new(search))
            .prefix("market context for")
            .query_from("file_name");

        let p = node.run(&state()).await;
        assert_eq!(
            p.get(SEARCH_RESULTS),
            Some(&json!({"web_search": [{
                "title": "Acme Q3",
                "link": "https://acme.test/q3",
                "snippet": "Revenue up"
            }]}))
        );
        assert_eq!(queries.lock().unwrap()[0], "market context for acme q3 report.txt");
    }

    #[tokio::test]
    async fn test_unavailable_backend_gives_empty_list() {
        let node = SearchNode::new("web_search", Arc::new(StaticSearch::unavailable()));
        let p = node.run(&state()).await;
        assert_eq!(p.get(SEARCH_RESULTS), Some(&json!({"web_search": []})));
    }
}
