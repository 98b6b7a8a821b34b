//! Shell scripts standing in for the diagram engine in tests.

use std::path::Path;

use tempfile::TempDir;

use crate::engine::EngineSettings;

/// Leading bytes every fake pipe-mode image starts with.
pub(crate) const FAKE_PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Pipe-mode engine: answers each unit with a PNG signature, the unit's
/// non-empty lines joined by `|`, and the delimiter line.
pub(crate) const PIPE_ENGINE: &str = r#"
delim=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-pipedelimitor" ]; then shift; delim="$1"; fi
  shift
done
unit=""
while IFS= read -r line; do
  [ -z "$line" ] && continue
  unit="$unit$line|"
  case "$line" in
    @end*)
      printf '\211PNG\r\n\032\n%s\n' "$unit"
      printf '%s\n' "$delim"
      unit=""
      ;;
  esac
done
"#;

/// [`PIPE_ENGINE`] that waits half a second before each answer.
pub(crate) fn slow_pipe_engine() -> String {
    PIPE_ENGINE.replace("      printf '\\211PNG", "      sleep 0.5\n      printf '\\211PNG")
}

/// Engine that exits before answering.
pub(crate) const EXITING_ENGINE: &str = "exit 3\n";

/// Engine that writes part of an image and exits without a delimiter.
pub(crate) const TRUNCATING_ENGINE: &str = r"
while IFS= read -r line; do
  case $line in
    @end*) printf 'partial'; exit 0 ;;
  esac
done
";

/// Engine that swallows input and never answers.
pub(crate) const SILENT_ENGINE: &str = "cat > /dev/null\n";

/// Write `script` into a temporary directory and return settings running it
/// with `sh` in place of the engine artifact.
pub(crate) fn script_engine(name: &str, script: &str) -> (TempDir, EngineSettings) {
    let dir = TempDir::new().unwrap();
    let path = write_script(dir.path(), name, script);
    let settings = EngineSettings::new().runtime("sh", &[]).jar(path);
    (dir, settings)
}

pub(crate) fn write_script(dir: &Path, name: &str, script: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
    path
}
