//! Render diagram markup to images through a PlantUML engine.
//!
//! The engine runs either as one long-lived pipe-mode process
//! ([`PipeConverter`]) or as its local HTTP server ([`ServiceConverter`]).
//! [`open`] builds the backend selected in `umlpipe.toml`, wrapped in a
//! [`ContentCache`] unless caching is disabled.
//!
//! # Example
//!
//! ```ignore
//! let config = umlpipe::Config::load(None)?;
//! let converter = umlpipe::open(&config)?;
//! let png = converter.convert_to_vec("A --> B").await?;
//! converter.dispose().await?;
//! ```

pub use umlpipe_cache::{ContentCache, content_hash};
pub use umlpipe_config::{Backend, CacheConfig, Config, ConfigError, EngineConfig, ServiceConfig};
pub use umlpipe_convert::{
    ConvertError, Converter, EngineSettings, ErrorKind, PipeConverter, ServiceConverter,
    ensure_end_marker, single_unit, split_sections,
};

/// Engine launch settings from the `[engine]` section.
#[must_use]
pub fn engine_settings(config: &EngineConfig) -> EngineSettings {
    EngineSettings {
        runtime: config.runtime.clone(),
        runtime_args: config.runtime_args.clone(),
        jar: config.jar.clone(),
        graphviz_dot: config.graphviz_dot.clone(),
        options: config.options.clone(),
    }
}

/// Build the configured converter.
///
/// The engine artifact is resolved here so a misconfigured path fails before
/// the first conversion. No engine process is started until then.
///
/// # Errors
///
/// Returns [`ConvertError::Resolution`] if the engine artifact is missing.
pub fn open(config: &Config) -> Result<Box<dyn Converter>, ConvertError> {
    let engine = &config.engine_resolved;
    let settings = engine_settings(engine);
    let jar = settings.resolve_jar()?;

    let converter: Box<dyn Converter> = match config.backend {
        Backend::Pipe => Box::new(PipeConverter::new(settings).timeout(engine.timeout)),
        Backend::Service => Box::new(
            ServiceConverter::new(settings)
                .host(config.service.host.clone())
                .port(config.service.port)
                .render_type(config.service.render_type.clone())
                .startup_timeout(config.service.startup_timeout())
                .timeout(engine.timeout),
        ),
    };
    tracing::info!(backend = ?config.backend, jar = %jar.display(), "Opened converter");

    let cache = &config.cache_resolved;
    if !cache.enabled {
        return Ok(converter);
    }
    tracing::debug!(dir = %cache.dir.display(), "Caching conversions");
    Ok(Box::new(ContentCache::new(converter, cache.dir.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tempfile::TempDir;

    fn load(dir: &Path, toml: &str) -> Config {
        let path = dir.join("umlpipe.toml");
        std::fs::write(&path, toml).unwrap();
        Config::load(Some(&path)).unwrap()
    }

    #[test]
    fn test_engine_settings_from_config() {
        let tmp = TempDir::new().unwrap();
        let config = load(
            tmp.path(),
            r#"
[engine]
runtime = "/usr/bin/java"
runtime_args = ["-Xmx1g", "-jar"]
jar = "plantuml.jar"
options = ["-charset", "UTF-8"]
"#,
        );

        let settings = engine_settings(&config.engine_resolved);
        assert_eq!(settings.runtime, "/usr/bin/java");
        assert_eq!(settings.runtime_args, vec!["-Xmx1g", "-jar"]);
        assert_eq!(settings.jar, Some(tmp.path().join("plantuml.jar")));
        assert_eq!(settings.options, vec!["-charset", "UTF-8"]);
    }

    #[test]
    fn test_open_missing_jar() {
        let tmp = TempDir::new().unwrap();
        let config = load(tmp.path(), "[engine]\njar = \"missing.jar\"\n");

        let err = open(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[tokio::test]
    async fn test_open_service_backend() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("plantuml.jar"), b"").unwrap();
        let config = load(
            tmp.path(),
            "backend = \"service\"\n[engine]\njar = \"plantuml.jar\"\n[service]\nport = 18000\n",
        );

        let converter = open(&config).unwrap();
        converter.dispose().await.unwrap();
        converter.dispose().await.unwrap();
    }

    #[cfg(unix)]
    mod pipe {
        use super::*;
        use pretty_assertions::assert_eq;

        const ENGINE: &str = r#"#!/bin/sh
delim=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-pipedelimitor" ]; then shift; delim="$1"; fi
  shift
done
while IFS= read -r line; do
  case "$line" in
    @end*) printf 'PNG%s\n' "$delim" ;;
  esac
done
"#;

        fn config(tmp: &TempDir, cache: bool) -> Config {
            std::fs::write(tmp.path().join("engine.sh"), ENGINE).unwrap();
            load(
                tmp.path(),
                &format!(
                    "[engine]\nruntime = \"sh\"\nruntime_args = []\njar = \"engine.sh\"\n\
                     [cache]\nenabled = {cache}\ndir = \"cache\"\n"
                ),
            )
        }

        #[tokio::test]
        async fn test_open_pipe_with_cache() {
            let tmp = TempDir::new().unwrap();
            let converter = open(&config(&tmp, true)).unwrap();

            let image = converter.convert_to_vec("A --> B").await.unwrap();
            assert_eq!(image, b"PNG");

            let entry = tmp.path().join("cache").join(content_hash("A --> B"));
            assert_eq!(std::fs::read(entry).unwrap(), b"PNG");
            converter.dispose().await.unwrap();
        }

        #[tokio::test]
        async fn test_open_pipe_without_cache() {
            let tmp = TempDir::new().unwrap();
            let converter = open(&config(&tmp, false)).unwrap();

            let image = converter.convert_to_vec("A --> B").await.unwrap();
            assert_eq!(image, b"PNG");
            assert!(!tmp.path().join("cache").exists());
            converter.dispose().await.unwrap();
        }
    }
}
