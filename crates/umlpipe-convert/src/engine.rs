//! Engine artifact resolution and process launch.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::ConvertError;

/// Directory next to the executable that holds the bundled engine.
const BUNDLED_DIR: &str = "plantuml";

/// File name of the bundled engine artifact.
const BUNDLED_JAR: &str = "plantuml.jar";

/// How to launch the external engine.
///
/// The command line is `runtime runtime_args… jar mode_args… options…`. With
/// the defaults that is `java -jar plantuml.jar <mode> …`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Program that hosts the engine.
    pub runtime: String,
    /// Arguments placed before the engine artifact.
    pub runtime_args: Vec<String>,
    /// Engine artifact. `None` selects `<exe dir>/plantuml/plantuml.jar`.
    pub jar: Option<PathBuf>,
    /// Graphviz `dot` executable, exported as `GRAPHVIZ_DOT`.
    pub graphviz_dot: Option<PathBuf>,
    /// Extra engine arguments appended after the mode arguments.
    pub options: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            runtime: "java".to_owned(),
            runtime_args: vec!["-jar".to_owned()],
            jar: None,
            graphviz_dot: None,
            options: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Settings for `java -jar <bundled plantuml.jar>`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit engine artifact.
    #[must_use]
    pub fn jar(mut self, jar: impl Into<PathBuf>) -> Self {
        self.jar = Some(jar.into());
        self
    }

    /// Host the engine with a different program and leading arguments.
    #[must_use]
    pub fn runtime(mut self, runtime: impl Into<String>, args: &[&str]) -> Self {
        self.runtime = runtime.into();
        self.runtime_args = args.iter().map(|&a| a.to_owned()).collect();
        self
    }

    /// Point the engine at a Graphviz `dot` executable.
    #[must_use]
    pub fn graphviz_dot(mut self, dot: impl Into<PathBuf>) -> Self {
        self.graphviz_dot = Some(dot.into());
        self
    }

    /// Append extra engine arguments (e.g. `-tsvg`, `-charset UTF-8`).
    #[must_use]
    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|&o| o.to_owned()).collect();
        self
    }

    /// Locate the engine artifact.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::Resolution`] if the artifact is not a file.
    pub fn resolve_jar(&self) -> Result<PathBuf, ConvertError> {
        let path = match &self.jar {
            Some(jar) => jar.clone(),
            None => bundled_jar(),
        };
        if path.is_file() {
            Ok(path)
        } else {
            Err(ConvertError::Resolution { path })
        }
    }

    /// Build the engine command for the given mode.
    ///
    /// The child is killed if its handle is dropped, so an abandoned
    /// converter never leaves an engine behind.
    pub(crate) fn command(&self, jar: &Path, mode_args: &[&str]) -> Command {
        let mut command = Command::new(&self.runtime);
        command
            .args(&self.runtime_args)
            .arg(jar)
            .args(mode_args)
            .args(&self.options)
            .kill_on_drop(true);
        if let Some(dot) = &self.graphviz_dot {
            command.env("GRAPHVIZ_DOT", dot);
        }
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command
    }

    pub(crate) fn spawn_error(&self, source: std::io::Error) -> ConvertError {
        ConvertError::Spawn {
            program: self.runtime.clone(),
            source,
        }
    }
}

/// Default artifact location next to the running executable.
fn bundled_jar() -> PathBuf {
    let dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(BUNDLED_DIR).join(BUNDLED_JAR)
}

/// Forward each line of an engine output stream to `log` until it closes.
pub(crate) fn forward_lines<R, F>(stream: R, log: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(&str) + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        log(line);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
}
