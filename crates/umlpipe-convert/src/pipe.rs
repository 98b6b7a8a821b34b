//! Pipe-mode converter backed by one long-lived engine process.
//!
//! The engine reads markup units on stdin and answers each with the rendered
//! image followed by a delimiter line. One instance owns one engine, and a
//! one-slot gate keeps a single conversion on the pipe at any time: the
//! engine has no request ids, so interleaved units would mix their output.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OnceCell};

use crate::consts::{DEFAULT_TIMEOUT, DISPOSE_TIMEOUT, LINE_SEPARATOR};
use crate::converter::Converter;
use crate::engine::{EngineSettings, forward_lines};
use crate::error::{ConvertError, ErrorKind};
use crate::markup::single_unit;
use crate::scanner::copy_until_async;

/// A running engine and its captured pipes.
struct PipeEngine {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl PipeEngine {
    /// Close stdin, drain stdout and wait for exit, killing after `limit`.
    async fn shutdown(self, limit: Duration) -> Result<(), ConvertError> {
        let Self {
            mut child,
            stdin,
            mut stdout,
        } = self;
        drop(stdin);

        let drain = async {
            tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
            child.wait().await
        };
        let outcome = tokio::time::timeout(limit, drain).await;

        match outcome {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Engine exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ConvertError::Pipe(e)),
            Err(_) => {
                tracing::warn!("Engine did not exit after its input closed, killing it");
                child.kill().await.map_err(ConvertError::Pipe)
            }
        }
    }
}

/// Engine slot guarded by the conversion gate.
enum Slot {
    /// No engine yet; the next conversion starts one.
    Idle,
    Running(PipeEngine),
    Disposed,
}

/// Converter that streams markup through a single engine process.
///
/// The engine starts on the first conversion and runs until
/// [`dispose`](Converter::dispose). Concurrent callers queue on the gate in
/// arrival order.
///
/// # Example
///
/// ```ignore
/// use umlpipe_convert::{Converter, EngineSettings, PipeConverter};
///
/// let converter = PipeConverter::new(EngineSettings::new().jar("plantuml.jar"));
/// let png = converter.convert_to_vec("A --> B").await?;
/// converter.dispose().await?;
/// ```
pub struct PipeConverter {
    settings: EngineSettings,
    /// Per-instance token the engine prints after every unit.
    delimiter: String,
    timeout: Option<Duration>,
    jar: OnceCell<PathBuf>,
    gate: Mutex<Slot>,
}

impl PipeConverter {
    /// Create a converter for the given engine. No process is started yet.
    #[must_use]
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            delimiter: uuid::Uuid::new_v4().to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            jar: OnceCell::new(),
            gate: Mutex::new(Slot::Idle),
        }
    }

    /// Set the per-conversion timeout. `None` waits indefinitely.
    ///
    /// Default is 60 seconds. Time spent queued on the gate is not counted.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delimiter token this instance passes to its engine.
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    async fn start(&self) -> Result<PipeEngine, ConvertError> {
        let jar = self
            .jar
            .get_or_try_init(|| async { self.settings.resolve_jar() })
            .await?;

        let mut child = self
            .settings
            .command(jar, &["-pipe", "-pipedelimitor", self.delimiter.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.settings.spawn_error(e))?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, |line| tracing::warn!(line, "Engine stderr"));
        }

        tracing::info!(pid = ?child.id(), jar = %jar.display(), "Started engine in pipe mode");
        Ok(PipeEngine {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Start the engine if needed and run one exchange on it.
    ///
    /// The engine travels by value: if this future is dropped mid-exchange
    /// the engine goes with it and is killed, so no caller can inherit a
    /// half-read answer.
    async fn run(
        &self,
        engine: Option<PipeEngine>,
        markup: &str,
    ) -> Result<(PipeEngine, Vec<u8>), ConvertError> {
        let mut engine = match engine {
            Some(engine) => engine,
            None => self.start().await?,
        };
        let image = self.exchange(&mut engine, markup).await?;
        Ok((engine, image))
    }

    /// Send one unit and capture the engine's answer up to the delimiter.
    async fn exchange(&self, engine: &mut PipeEngine, markup: &str) -> Result<Vec<u8>, ConvertError> {
        let PipeEngine {
            child,
            stdin,
            stdout,
        } = engine;

        let mut frame = String::with_capacity(markup.len() + 1);
        frame.push_str(markup);
        if !frame.ends_with('\n') {
            frame.push('\n');
        }
        let terminator = format!("{}{LINE_SEPARATOR}", self.delimiter);

        let write = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.flush().await
        };
        let mut image = Vec::new();
        let read = copy_until_async(stdout, terminator.as_bytes(), &mut image);

        let copied = match tokio::try_join!(write, read) {
            Ok(((), copied)) => copied,
            Err(e) => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(ConvertError::EngineExited {
                        status: Some(status),
                    });
                }
                return Err(ConvertError::Pipe(e));
            }
        };

        if !copied.delimited {
            return Err(ConvertError::StreamClosed {
                received: copied.bytes,
            });
        }
        Ok(image)
    }
}

fn missing_pipe(name: &str) -> ConvertError {
    ConvertError::Pipe(io::Error::other(format!("engine {name} was not captured")))
}

#[async_trait]
impl Converter for PipeConverter {
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError> {
        let markup = single_unit(markup)?;
        let mut slot = self.gate.lock().await;
        let engine = match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Running(engine) => Some(engine),
            Slot::Idle => None,
            Slot::Disposed => {
                *slot = Slot::Disposed;
                return Err(ConvertError::Disposed);
            }
        };
        let started = Instant::now();

        let run = self.run(engine, &markup);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .unwrap_or(Err(ConvertError::Timeout(limit))),
            None => run.await,
        };

        // A failed exchange drops the engine, which kills it
        let image = match result {
            Ok((engine, image)) => {
                *slot = Slot::Running(engine);
                image
            }
            Err(e) => {
                if matches!(e.kind(), ErrorKind::Process | ErrorKind::Timeout) {
                    tracing::warn!(error = %e, "Discarded engine after failed conversion");
                }
                return Err(e);
            }
        };
        drop(slot);

        tracing::debug!(
            input_len = markup.len(),
            output_len = image.len(),
            elapsed = ?started.elapsed(),
            "Converted markup"
        );
        output.write_all(&image).await?;
        output.flush().await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ConvertError> {
        let mut slot = self.gate.lock().await;
        match std::mem::replace(&mut *slot, Slot::Disposed) {
            Slot::Running(engine) => engine.shutdown(DISPOSE_TIMEOUT).await,
            Slot::Idle | Slot::Disposed => Ok(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{FAKE_PNG_SIGNATURE, script_engine};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_appends_end_marker_and_returns_image() {
        let (_dir, settings) = script_engine("pipe_engine.sh", crate::testing::PIPE_ENGINE);
        let converter = PipeConverter::new(settings);

        let image = converter.convert_to_vec("A --> B").await.unwrap();

        assert!(image.starts_with(FAKE_PNG_SIGNATURE));
        let body = String::from_utf8_lossy(&image[FAKE_PNG_SIGNATURE.len()..]).into_owned();
        assert_eq!(body, "A --> B|@end|\n");
        converter.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_conversions_share_one_engine() {
        let (_dir, settings) = script_engine("pipe_engine.sh", crate::testing::PIPE_ENGINE);
        let converter = PipeConverter::new(settings);

        let first = converter
            .convert_to_vec("@startuml\nAlice -> Bob\n@enduml\n")
            .await
            .unwrap();
        let second = converter
            .convert_to_vec("@startuml\nBob -> Alice\n@enduml")
            .await
            .unwrap();

        assert!(first.ends_with(b"@startuml|Alice -> Bob|@enduml|\n"));
        assert!(second.ends_with(b"@startuml|Bob -> Alice|@enduml|\n"));
        converter.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_conversions_do_not_interleave() {
        let (_dir, settings) = script_engine("pipe_engine.sh", crate::testing::PIPE_ENGINE);
        let converter = Arc::new(PipeConverter::new(settings));
        let markup = "@startuml\nAlice -> Bob: Authentication Request\nBob --> Alice: Authentication Response\n@enduml\n";

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let converter = Arc::clone(&converter);
                tokio::spawn(async move { converter.convert_to_vec(markup).await })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }

        assert_eq!(results.len(), 20);
        for result in &results {
            assert!(result.starts_with(FAKE_PNG_SIGNATURE));
            assert_eq!(result, &results[0]);
        }
        converter.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_diagrams_are_rejected_before_the_pipe() {
        let (_dir, settings) = script_engine("pipe_engine.sh", crate::testing::PIPE_ENGINE);
        let converter = PipeConverter::new(settings);

        let err = converter
            .convert_to_vec("@startuml\nA\n@enduml\n@startuml\nB\n@enduml\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::MultipleUnits { units: 2 }));
        assert_eq!(err.kind(), ErrorKind::Markup);

        let err = converter
            .convert_to_vec("@startuml\nA\n@enduml\nB\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::MultipleUnits { units: 2 }));

        let image = converter
            .convert_to_vec("@startuml\nC\n@enduml\n")
            .await
            .unwrap();
        assert!(image.ends_with(b"@startuml|C|@enduml|\n"));
        converter.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_tail_is_not_a_second_diagram() {
        let (_dir, settings) = script_engine("pipe_engine.sh", crate::testing::PIPE_ENGINE);
        let converter = PipeConverter::new(settings);

        let first = converter
            .convert_to_vec("@startuml\nA\n@enduml\n\n  \n")
            .await
            .unwrap();
        let second = converter
            .convert_to_vec("@startuml\nB\n@enduml\n")
            .await
            .unwrap();

        assert!(first.ends_with(b"@startuml|A|@enduml|\n"));
        assert!(second.ends_with(b"@startuml|B|@enduml|\n"));
        converter.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_conversion_does_not_leak_into_the_next() {
        let script = crate::testing::slow_pipe_engine();
        let (_dir, settings) = script_engine("slow_engine.sh", &script);
        let converter = PipeConverter::new(settings).timeout(None);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(200), converter.convert_to_vec("X")).await;
        assert!(cancelled.is_err());
        assert!(matches!(*converter.gate.lock().await, Slot::Idle));

        let image = converter.convert_to_vec("Y").await.unwrap();
        assert!(image.starts_with(FAKE_PNG_SIGNATURE));
        let body = String::from_utf8_lossy(&image[FAKE_PNG_SIGNATURE.len()..]).into_owned();
        assert_eq!(body, "Y|@end|\n");
        converter.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_jar_fails_before_spawn() {
        let dir = tempfile::TempDir::new().unwrap();
        let converter =
            PipeConverter::new(EngineSettings::new().jar(dir.path().join("plantuml.jar")));

        let err = converter.convert_to_vec("A --> B").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(matches!(*converter.gate.lock().await, Slot::Idle));
    }

    #[tokio::test]
    async fn test_engine_exit_is_an_error() {
        let (_dir, settings) = script_engine("exit_engine.sh", crate::testing::EXITING_ENGINE);
        let converter = PipeConverter::new(settings);

        let err = converter.convert_to_vec("A --> B").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert!(matches!(*converter.gate.lock().await, Slot::Idle));
    }

    #[tokio::test]
    async fn test_truncated_output_is_an_error() {
        let (_dir, settings) = script_engine("truncating_engine.sh", crate::testing::TRUNCATING_ENGINE);
        let converter = PipeConverter::new(settings);

        let mut output = Vec::new();
        let err = converter.convert("A --> B", &mut output).await.unwrap_err();

        assert!(
            matches!(err, ConvertError::StreamClosed { received } if received > 0)
                || err.kind() == ErrorKind::Process,
            "{err:?}"
        );
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_releases_gate() {
        let (_dir, settings) = script_engine("silent_engine.sh", crate::testing::SILENT_ENGINE);
        let converter =
            PipeConverter::new(settings).timeout(Some(Duration::from_millis(300)));

        let err = converter.convert_to_vec("A --> B").await.unwrap_err();
        assert!(matches!(err, ConvertError::Timeout(_)));

        // The gate is free again and the hung engine was discarded
        let err = converter.convert_to_vec("A --> B").await.unwrap_err();
        assert!(matches!(err, ConvertError::Timeout(_)));
        converter.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (_dir, settings) = script_engine("pipe_engine.sh", crate::testing::PIPE_ENGINE);
        let converter = PipeConverter::new(settings);
        converter.convert_to_vec("A --> B").await.unwrap();

        converter.dispose().await.unwrap();
        converter.dispose().await.unwrap();

        let err = converter.convert_to_vec("A --> B").await.unwrap_err();
        assert!(matches!(err, ConvertError::Disposed));
    }

    #[tokio::test]
    async fn test_dispose_without_conversion() {
        let converter = PipeConverter::new(EngineSettings::new());
        converter.dispose().await.unwrap();
        converter.dispose().await.unwrap();
    }

    #[test]
    fn test_delimiters_are_unique_per_instance() {
        let a = PipeConverter::new(EngineSettings::new());
        let b = PipeConverter::new(EngineSettings::new());
        assert_ne!(a.delimiter(), b.delimiter());
        assert_eq!(a.delimiter().len(), 36);
    }
}
