use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Generation oracle: turns a conversation into text or a structured object.
///
/// When `schema` is given, an `Ok` response must be `Generation::Structured`
/// and already validated against it.
pub trait GenerationOracle: Send + Sync + 'static {
    fn generate<'a>(
        &'a self,
        messages: Vec<ChatMessage>,
        schema: Option<&'a OutputSchema>,
    ) -> BoxFuture<'a, Result<Generation>>;
}

/// Sandboxed executor: runs an artifact against named data bindings.
///
/// Implementations own their bindings argument; callers keep the original.
/// Any failure, including a crash of the interpreter, is an `Err` carrying
/// diagnostic text, never a panic of the host.
pub trait SandboxExecutor: Send + Sync + 'static {
    fn execute<'a>(&'a self, artifact: &'a str, bindings: Bindings)
        -> BoxFuture<'a, Result<Bindings>>;

    /// Timeout in seconds for one execution.
    fn timeout_secs(&self) -> u64 {
        60
    }
}

/// Keyword-search oracle. Returns an empty list on failure.
pub trait SearchOracle: Send + Sync + 'static {
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Vec<SearchHit>>;
}
