pub mod docker;
pub mod process;

use std::path::Path;

use refinery_core::error::{RefineryError, Result};
use refinery_core::types::Bindings;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

pub(crate) const HARNESS_FILE: &str = "harness.py";
pub(crate) const ARTIFACT_FILE: &str = "artifact.py";
pub(crate) const BINDINGS_IN: &str = "bindings.json";
pub(crate) const BINDINGS_OUT: &str = "bindings_out.json";

/// Loads the bindings as globals, runs the artifact, and dumps every
/// binding (old and new, non-underscore, serializable) back out.
/// Objects exposing `to_dict` (e.g. data frames) are written as records.
/// NaN and infinities become null, since JSON has no literal for them.
const HARNESS: &str = r#"import json, math

with open("bindings.json") as f:
    bindings = json.load(f)
scope = dict(bindings)
with open("artifact.py") as f:
    source = f.read()
exec(compile(source, "artifact", "exec"), scope)

def clean(value):
    if hasattr(value, "to_dict"):
        try:
            value = value.to_dict(orient="records")
        except TypeError:
            value = value.to_dict()
    elif hasattr(value, "item") and not isinstance(value, (str, bytes)):
        try:
            value = value.item()
        except (TypeError, ValueError):
            pass
    if isinstance(value, float):
        return value if math.isfinite(value) else None
    if isinstance(value, dict):
        return {str(k): clean(v) for k, v in value.items()}
    if isinstance(value, (list, tuple)):
        return [clean(v) for v in value]
    return value

out = {}
for name, value in scope.items():
    if name.startswith("_") or callable(value) or type(value).__name__ == "module":
        continue
    try:
        value = clean(value)
        json.dumps(value, allow_nan=False)
    except (TypeError, ValueError):
        continue
    out[name] = value
with open("bindings_out.json", "w") as f:
    json.dump(out, f, allow_nan=False)
"#;

/// Write harness, artifact, and input bindings into `dir`.
pub(crate) fn stage_files(dir: &Path, artifact: &str, bindings: &Bindings) -> Result<()> {
    std::fs::write(dir.join(HARNESS_FILE), HARNESS)?;
    std::fs::write(dir.join(ARTIFACT_FILE), artifact)?;
    std::fs::write(dir.join(BINDINGS_IN), serde_json::to_vec(bindings)?)?;
    Ok(())
}

/// Read the bindings the harness wrote after a successful run.
pub(crate) fn collect_bindings(dir: &Path) -> Result<Bindings> {
    let raw = std::fs::read(dir.join(BINDINGS_OUT)).map_err(|e| {
        RefineryError::SandboxExecution(format!("harness wrote no bindings: {}", e))
    })?;
    let bindings: Bindings = serde_json::from_slice(&raw)
        .map_err(|e| RefineryError::SandboxExecution(format!("unreadable bindings: {}", e)))?;
    Ok(bindings)
}

/// Keep the tail of interpreter output, where tracebacks end.
pub(crate) fn diagnostic_tail(output: &str, max: usize) -> String {
    let trimmed = output.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max).collect();
    format!("... {}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = Bindings::new();
        b.insert("df".into(), json!([{"a": 1}]));
        stage_files(dir.path(), "df = df", &b).unwrap();

        let staged: Bindings =
            serde_json::from_slice(&std::fs::read(dir.path().join(BINDINGS_IN)).unwrap()).unwrap();
        assert_eq!(staged, b);
        assert!(dir.path().join(HARNESS_FILE).exists());

        std::fs::write(dir.path().join(BINDINGS_OUT), r#"{"df": [], "n": 3}"#).unwrap();
        let out = collect_bindings(dir.path()).unwrap();
        assert_eq!(out["n"], json!(3));
    }

    #[test]
    fn test_missing_output_is_sandbox_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            collect_bindings(dir.path()),
            Err(RefineryError::SandboxExecution(_))
        ));
    }

    #[test]
    fn test_diagnostic_tail() {
        assert_eq!(diagnostic_tail("  short \n", 10), "short");
        assert_eq!(diagnostic_tail("abcdefghij", 3), "... hij");
    }
}
