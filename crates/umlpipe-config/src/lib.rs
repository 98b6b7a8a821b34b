//! Loading of `umlpipe.toml`.
//!
//! The file is taken from an explicit path or found by walking up from the
//! current directory. Relative paths in it resolve against its directory.
//!
//! ## Environment variables
//!
//! `${VAR}` (error when unset) and `${VAR:-fallback}` are expanded in:
//! - `engine.jar`
//! - `engine.graphviz_dot`
//! - `service.host`
//! - `cache.dir`

mod expand;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up during discovery.
const CONFIG_FILENAME: &str = "umlpipe.toml";

/// Render types the engine service understands.
const RENDER_TYPES: &[&str] = &["png", "svg", "txt"];

/// Which converter backend to run the engine with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Long-lived subprocess fed over stdin/stdout.
    #[default]
    Pipe,
    /// Local HTTP server addressed per conversion.
    Service,
}

/// Engine, service and cache settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Converter backend.
    pub backend: Backend,
    /// Engine configuration (paths are raw strings from TOML).
    engine: EngineConfigRaw,
    /// Local rendering service configuration.
    pub service: ServiceConfig,
    /// Cache configuration (paths are raw strings from TOML).
    cache: CacheConfigRaw,

    /// Resolved engine configuration (set after loading).
    #[serde(skip)]
    pub engine_resolved: EngineConfig,
    /// Resolved cache configuration (set after loading).
    #[serde(skip)]
    pub cache_resolved: CacheConfig,
    /// Path to the config file (set after loading).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::default_with_base(Path::new("."))
    }
}

/// Raw engine configuration as parsed from TOML.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct EngineConfigRaw {
    runtime: String,
    runtime_args: Vec<String>,
    jar: Option<String>,
    graphviz_dot: Option<String>,
    options: Vec<String>,
    timeout_secs: u64,
}

impl Default for EngineConfigRaw {
    fn default() -> Self {
        Self {
            runtime: "java".to_owned(),
            runtime_args: vec!["-jar".to_owned()],
            jar: None,
            graphviz_dot: None,
            options: Vec::new(),
            timeout_secs: 60,
        }
    }
}

/// Resolved engine configuration with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Program that hosts the engine (e.g. `java`).
    pub runtime: String,
    /// Arguments passed to the runtime before the engine artifact.
    pub runtime_args: Vec<String>,
    /// Engine artifact. `None` selects the default location.
    pub jar: Option<PathBuf>,
    /// Graphviz `dot` executable exported to the engine as `GRAPHVIZ_DOT`.
    pub graphviz_dot: Option<PathBuf>,
    /// Extra engine arguments appended after the mode arguments.
    pub options: Vec<String>,
    /// Per-conversion timeout. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let raw = EngineConfigRaw::default();
        Self {
            runtime: raw.runtime,
            runtime_args: raw.runtime_args,
            jar: None,
            graphviz_dot: None,
            options: raw.options,
            timeout: Some(Duration::from_secs(raw.timeout_secs)),
        }
    }
}

/// Local rendering service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Loopback address the service binds to.
    pub host: String,
    /// First port to bind. Each restart moves to the next port.
    pub port: u16,
    /// Render type path segment (`png`, `svg` or `txt`).
    pub render_type: String,
    /// How long to wait for a freshly started service to accept connections.
    pub startup_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 16395,
            render_type: "png".to_owned(),
            startup_timeout_secs: 30,
        }
    }
}

impl ServiceConfig {
    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Raw cache configuration as parsed from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CacheConfigRaw {
    enabled: Option<bool>,
    dir: Option<String>,
}

/// Resolved cache configuration with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheConfig {
    /// Whether conversions are memoized on disk.
    pub enabled: bool,
    /// Cache root directory.
    pub dir: PathBuf,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("config file {} does not exist", .0.display())]
    NotFound(PathBuf),
    /// I/O error.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error.
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    /// Validation error.
    #[error("invalid configuration: {0}")]
    Validation(String),
    /// Environment variable error during expansion.
    #[error("cannot expand {field}: {message}")]
    EnvVar {
        /// Config field path (e.g., "`engine.jar`").
        field: String,
        /// Error message (e.g., "${`PLANTUML_JAR`} not set").
        message: String,
    },
}

/// Require a string field to be non-empty.
fn require_non_empty(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

impl Config {
    /// Load configuration from file.
    ///
    /// If `config_path` is provided, loads from that file.
    /// Otherwise, searches for `umlpipe.toml` in current directory and parents.
    ///
    /// # Errors
    ///
    /// Returns error if explicit `config_path` doesn't exist or parsing fails.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Self::load_from_file(path)
        } else if let Some(discovered) = Self::discover_config() {
            Self::load_from_file(&discovered)
        } else {
            Ok(Self::default_with_cwd())
        }
    }

    /// Walk up from the current directory looking for the config file.
    fn discover_config() -> Option<PathBuf> {
        let mut current = std::env::current_dir().ok()?;
        loop {
            let candidate = current.join(CONFIG_FILENAME);
            if candidate.exists() {
                return Some(candidate);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    /// Defaults rooted at the current directory.
    fn default_with_cwd() -> Self {
        let cwd = std::env::current_dir().unwrap_or_default();
        Self::default_with_base(&cwd)
    }

    /// Defaults rooted at `base`.
    fn default_with_base(base: &Path) -> Self {
        Self {
            backend: Backend::default(),
            engine: EngineConfigRaw::default(),
            service: ServiceConfig::default(),
            cache: CacheConfigRaw::default(),
            engine_resolved: EngineConfig::default(),
            cache_resolved: CacheConfig {
                enabled: true,
                dir: base.join(".umlpipe").join("cache"),
            },
            config_path: None,
        }
    }

    /// Parse, expand, resolve and validate one file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;

        // Expand environment variables before path resolution
        config.expand_env_vars()?;

        let config_dir = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(config_dir);
        config.config_path = Some(path.to_path_buf());

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Called automatically after loading from file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_engine()?;
        self.validate_service()?;
        Ok(())
    }

    fn validate_engine(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.engine_resolved.runtime, "engine.runtime")
    }

    fn validate_service(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.service.host, "service.host")?;

        // Port 0 would let the OS choose, and the converter could not know
        // which port to address
        if self.service.port == 0 {
            return Err(ConfigError::Validation(
                "service.port cannot be 0".to_owned(),
            ));
        }
        if !RENDER_TYPES.contains(&self.service.render_type.as_str()) {
            return Err(ConfigError::Validation(format!(
                "service.render_type must be one of {}",
                RENDER_TYPES.join(", ")
            )));
        }
        if self.service.startup_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "service.startup_timeout_secs must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Apply `${VAR}` expansion to the fields that allow it.
    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        self.service.host = expand::expand_env(&self.service.host, "service.host")?;

        if let Some(ref jar) = self.engine.jar {
            self.engine.jar = Some(expand::expand_env(jar, "engine.jar")?);
        }
        if let Some(ref dot) = self.engine.graphviz_dot {
            self.engine.graphviz_dot = Some(expand::expand_env(dot, "engine.graphviz_dot")?);
        }
        if let Some(ref dir) = self.cache.dir {
            self.cache.dir = Some(expand::expand_env(dir, "cache.dir")?);
        }

        Ok(())
    }

    /// Fill the resolved sections, joining relative paths onto `config_dir`.
    fn resolve_paths(&mut self, config_dir: &Path) {
        let timeout = match self.engine.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        self.engine_resolved = EngineConfig {
            runtime: self.engine.runtime.clone(),
            runtime_args: self.engine.runtime_args.clone(),
            jar: self.engine.jar.as_deref().map(|p| config_dir.join(p)),
            graphviz_dot: self.engine.graphviz_dot.as_deref().map(|p| config_dir.join(p)),
            options: self.engine.options.clone(),
            timeout,
        };

        self.cache_resolved = CacheConfig {
            enabled: self.cache.enabled.unwrap_or(true),
            dir: config_dir.join(self.cache.dir.as_deref().unwrap_or(".umlpipe/cache")),
        };
    }
}
