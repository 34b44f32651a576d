//! Scripted collaborators and fixtures shared by the Refinery test suites.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::{GenerationOracle, SandboxExecutor, SearchOracle};
use refinery_core::types::*;

/// Shared call counter handed out by the mocks.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Script {
    queue: VecDeque<Result<Generation>>,
    repeat: Option<Generation>,
}

impl Script {
    fn has_steps(&self) -> bool {
        !self.queue.is_empty() || self.repeat.is_some()
    }

    fn next(&mut self) -> Option<Result<Generation>> {
        self.queue
            .pop_front()
            .or_else(|| self.repeat.clone().map(Ok))
    }
}

const DEFAULT_SCRIPT: &str = "";

/// A generation oracle that replays queued responses.
///
/// Responses can be queued per schema name (`then_for`) so that one oracle can
/// drive both artifact generation and critique. Requests without a matching
/// schema queue use the default queue. Structured responses are validated
/// against the requested schema, like a real client.
#[derive(Default)]
pub struct ScriptedOracle {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    calls: CallCounter,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, key: &str, step: Result<Generation>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(key.to_string()).or_default().queue.push_back(step);
        }
        self
    }

    fn set_repeat(self, key: &str, generation: Generation) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(key.to_string()).or_default().repeat = Some(generation);
        }
        self
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.push(DEFAULT_SCRIPT, Ok(Generation::Text(text.into())))
    }

    pub fn then_structured(self, value: serde_json::Value) -> Self {
        self.push(DEFAULT_SCRIPT, Ok(Generation::Structured(value)))
    }

    pub fn then_err(self, err: RefineryError) -> Self {
        self.push(DEFAULT_SCRIPT, Err(err))
    }

    /// Answer every default request with `text` once the queue is drained.
    pub fn repeat_text(self, text: impl Into<String>) -> Self {
        self.set_repeat(DEFAULT_SCRIPT, Generation::Text(text.into()))
    }

    /// Queue a structured response for requests using the named schema.
    pub fn then_for(self, schema: &str, value: serde_json::Value) -> Self {
        self.push(schema, Ok(Generation::Structured(value)))
    }

    pub fn then_err_for(self, schema: &str, err: RefineryError) -> Self {
        self.push(schema, Err(err))
    }

    /// Answer every request for the named schema with `value` once its queue is drained.
    pub fn repeat_for(self, schema: &str, value: serde_json::Value) -> Self {
        self.set_repeat(schema, Generation::Structured(value))
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }

    /// Every message list received, in call order.
    pub fn request_log(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        self.requests.clone()
    }

    fn next_for(&self, schema: Option<&OutputSchema>) -> Result<Generation> {
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| RefineryError::OracleRequest("script lock poisoned".into()))?;
        let key = schema
            .map(|s| s.name.as_str())
            .filter(|name| scripts.get(*name).is_some_and(Script::has_steps))
            .unwrap_or(DEFAULT_SCRIPT)
            .to_string();
        scripts
            .get_mut(&key)
            .and_then(Script::next)
            .unwrap_or_else(|| Err(RefineryError::OracleRequest("script exhausted".into())))
    }
}

impl GenerationOracle for ScriptedOracle {
    fn generate<'a>(
        &'a self,
        messages: Vec<ChatMessage>,
        schema: Option<&'a OutputSchema>,
    ) -> BoxFuture<'a, Result<Generation>> {
        Box::pin(async move {
            self.calls.bump();
            if let Ok(mut log) = self.requests.lock() {
                log.push(messages);
            }
            let generation = self.next_for(schema)?;
            match (schema, &generation) {
                (Some(s), Generation::Structured(v)) => s.validate(v)?,
                (Some(s), Generation::Text(t)) => {
                    return Err(RefineryError::OracleParse(format!(
                        "expected '{}' object, got text: {}",
                        s.name, t
                    )))
                }
                (None, _) => {}
            }
            Ok(generation)
        })
    }
}

type SandboxFn = dyn Fn(&str, Bindings) -> Result<Bindings> + Send + Sync;

/// A sandbox whose behavior is a closure over (artifact, bindings).
pub struct ScriptedSandbox {
    run: Box<SandboxFn>,
    calls: CallCounter,
}

impl ScriptedSandbox {
    pub fn new(run: impl Fn(&str, Bindings) -> Result<Bindings> + Send + Sync + 'static) -> Self {
        Self {
            run: Box::new(run),
            calls: CallCounter::default(),
        }
    }

    /// Returns the bindings unchanged.
    pub fn passthrough() -> Self {
        Self::new(|_, b| Ok(b))
    }

    /// Every execution fails with `diagnostic`.
    pub fn always_failing(diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self::new(move |_, _| Err(RefineryError::SandboxExecution(diagnostic.clone())))
    }

    /// Fails when the artifact contains `marker`; otherwise sets binding
    /// `name` to the artifact text so tests can see which candidate ran.
    pub fn failing_on(marker: impl Into<String>, name: impl Into<String>) -> Self {
        let marker = marker.into();
        let name = name.into();
        Self::new(move |artifact, mut bindings| {
            if artifact.contains(&marker) {
                return Err(RefineryError::SandboxExecution(format!(
                    "Traceback: artifact contains '{}'",
                    marker
                )));
            }
            bindings.insert(name.clone(), serde_json::Value::String(artifact.to_string()));
            Ok(bindings)
        })
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl SandboxExecutor for ScriptedSandbox {
    fn execute<'a>(
        &'a self,
        artifact: &'a str,
        bindings: Bindings,
    ) -> BoxFuture<'a, Result<Bindings>> {
        Box::pin(async move {
            self.calls.bump();
            (self.run)(artifact, bindings)
        })
    }
}

/// Search oracle returning a fixed hit list for every query.
#[derive(Default)]
pub struct StaticSearch {
    hits: Vec<SearchHit>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl StaticSearch {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            queries: Arc::default(),
        }
    }

    /// A backend that is down; like a real adapter it reports no hits.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn query_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.queries.clone()
    }
}

impl SearchOracle for StaticSearch {
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Vec<SearchHit>> {
        Box::pin(async move {
            if let Ok(mut q) = self.queries.lock() {
                q.push(query.to_string());
            }
            self.hits.clone()
        })
    }
}

pub fn hit(title: &str, link: &str, snippet: &str) -> SearchHit {
    SearchHit {
        title: title.into(),
        link: link.into(),
        snippet: snippet.into(),
    }
}

/// A small tabular data set as JSON records.
pub fn sample_records() -> serde_json::Value {
    serde_json::json!([
        {"revenue": 120.0, "profit": 30.0, "cost": 90.0},
        {"revenue": null, "profit": 12.5, "cost": 40.0},
        {"revenue": 95.0, "profit": -5.0, "cost": 100.0}
    ])
}

/// A structured artifact response.
pub fn artifact(code: &str, explanation: &str) -> serde_json::Value {
    serde_json::json!({"code": code, "explanation": explanation})
}

/// A structured critic verdict.
pub fn verdict(should_continue: bool, review: &str) -> serde_json::Value {
    serde_json::json!({"should_continue": should_continue, "review": review})
}

/// Write `content` to a temp file and keep it alive for the test.
pub fn temp_file(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    f.write_all(content.as_bytes()).expect("write temp file");
    f
}
