//! Service-mode converter backed by the engine's built-in HTTP server.
//!
//! The engine runs as a local web server and every conversion is one
//! `GET /<render type>/<encoded markup>` request. Requests run independently;
//! only server startup and restart go through the state lock.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{Mutex, OnceCell};
use ureq::Agent;

use crate::consts::{
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RENDER_TYPE, DEFAULT_STARTUP_TIMEOUT, DEFAULT_TIMEOUT,
    READY_POLL_INTERVAL,
};
use crate::converter::Converter;
use crate::engine::{EngineSettings, forward_lines};
use crate::error::ConvertError;

/// Encode markup with the engine's hex text encoding (`~h` + UTF-8 hex).
#[must_use]
pub fn encode_markup(markup: &str) -> String {
    format!("~h{}", hex::encode(markup.as_bytes()))
}

/// Content type of the image the engine returns for a render type.
///
/// The engine answers diagram syntax errors with an error status and an
/// image describing the error; a matching content type marks such a body
/// as renderable.
fn image_content_type(render_type: &str) -> &'static str {
    match render_type {
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        _ => "image/png",
    }
}

/// Create an HTTP agent with the given timeout.
///
/// Status codes are handled by the caller, so error responses keep their body.
fn create_agent(timeout: Option<Duration>) -> Agent {
    Agent::config_builder()
        .timeout_global(timeout)
        .http_status_as_error(false)
        .build()
        .into()
}

/// Fetch one rendered image.
fn send_request(agent: &Agent, url: &str, content_type: &str) -> Result<Vec<u8>, ConvertError> {
    let response = agent.get(url).call().map_err(|e| match e {
        ureq::Error::Timeout(_) => ConvertError::Timeout(Duration::ZERO),
        e => ConvertError::Http(e),
    })?;

    let status = response.status().as_u16();
    let renderable = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(content_type));
    let mut body = response.into_body();

    if status >= 400 && !renderable {
        let error_body = body
            .read_to_string()
            .unwrap_or_else(|_| String::from("(unable to read error body)"));
        return Err(ConvertError::HttpStatus {
            status,
            body: error_body,
        });
    }

    Ok(body.read_to_vec()?)
}

struct Server {
    child: Child,
    port: u16,
}

enum ServerSlot {
    Stopped,
    Running(Server),
    Disposed,
}

struct ServiceState {
    slot: ServerSlot,
    /// Port for the next server start.
    next_port: u16,
}

/// Converter that renders through a local engine HTTP server.
///
/// The server starts on the first conversion. When it is found dead before
/// a conversion it is restarted on the next port, since the old socket may
/// still be draining.
pub struct ServiceConverter {
    settings: EngineSettings,
    host: String,
    render_type: String,
    startup_timeout: Duration,
    timeout: Option<Duration>,
    agent: Agent,
    jar: OnceCell<PathBuf>,
    state: Mutex<ServiceState>,
}

impl ServiceConverter {
    /// Create a converter for `127.0.0.1:16395` rendering PNG.
    #[must_use]
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            host: DEFAULT_HOST.to_owned(),
            render_type: DEFAULT_RENDER_TYPE.to_owned(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            timeout: Some(DEFAULT_TIMEOUT),
            agent: create_agent(Some(DEFAULT_TIMEOUT)),
            jar: OnceCell::new(),
            state: Mutex::new(ServiceState {
                slot: ServerSlot::Stopped,
                next_port: DEFAULT_PORT,
            }),
        }
    }

    /// Bind the server to `host`.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// First port to bind. Restarts continue from the following ports.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.state.get_mut().next_port = port;
        self
    }

    /// Request path segment selecting the output format (`png`, `svg`, `txt`).
    #[must_use]
    pub fn render_type(mut self, render_type: impl Into<String>) -> Self {
        self.render_type = render_type.into();
        self
    }

    /// Time allowed for a starting server to accept connections.
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Per-request timeout. `None` waits indefinitely.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self.agent = create_agent(timeout);
        self
    }

    /// Return the port of a live server, starting or restarting it as needed.
    async fn ensure_server(&self) -> Result<u16, ConvertError> {
        let mut state = self.state.lock().await;

        match &mut state.slot {
            ServerSlot::Running(server) => match server.child.try_wait() {
                Ok(None) => return Ok(server.port),
                Ok(Some(status)) => {
                    tracing::info!(port = server.port, %status, "Engine service exited, restarting");
                }
                Err(e) => {
                    tracing::warn!(port = server.port, error = %e, "Cannot query engine service, restarting");
                }
            },
            ServerSlot::Stopped => {}
            ServerSlot::Disposed => return Err(ConvertError::Disposed),
        }

        let port = state.next_port;
        state.next_port = port.wrapping_add(1).max(1);
        state.slot = ServerSlot::Stopped;

        let server = self.start(port).await?;
        state.slot = ServerSlot::Running(server);
        Ok(port)
    }

    async fn start(&self, port: u16) -> Result<Server, ConvertError> {
        let jar = self
            .jar
            .get_or_try_init(|| async { self.settings.resolve_jar() })
            .await?;

        if TcpStream::connect((self.host.as_str(), port)).await.is_ok() {
            tracing::warn!(port, host = %self.host, "Port already accepts connections before the engine service starts");
        }

        let bind = format!("-picoweb:{port}:{}", self.host);
        let mut child = self
            .settings
            .command(jar, &[bind.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.settings.spawn_error(e))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, |line| tracing::debug!(line, "Engine service stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, |line| tracing::warn!(line, "Engine service stderr"));
        }
        tracing::info!(port, host = %self.host, pid = ?child.id(), "Starting engine service");

        if let Err(e) = self.wait_until_ready(&mut child, port).await {
            if let Err(kill) = child.kill().await {
                tracing::warn!(error = %kill, "Failed to kill engine service");
            }
            return Err(e);
        }
        Ok(Server { child, port })
    }

    /// Poll until the server accepts connections or dies.
    ///
    /// A connection only counts while the engine is still alive, so a
    /// listener left on the port by another process cannot stand in for an
    /// engine that exited during startup.
    async fn wait_until_ready(&self, child: &mut Child, port: u16) -> Result<(), ConvertError> {
        let started = Instant::now();
        loop {
            exited(child)?;
            if TcpStream::connect((self.host.as_str(), port)).await.is_ok() {
                exited(child)?;
                tracing::info!(port, elapsed = ?started.elapsed(), "Engine service ready");
                return Ok(());
            }
            if started.elapsed() >= self.startup_timeout {
                return Err(ConvertError::Timeout(self.startup_timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// Fail if `child` has already exited.
fn exited(child: &mut Child) -> Result<(), ConvertError> {
    match child.try_wait().map_err(ConvertError::Pipe)? {
        Some(status) => Err(ConvertError::EngineExited {
            status: Some(status),
        }),
        None => Ok(()),
    }
}

#[async_trait]
impl Converter for ServiceConverter {
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError> {
        let port = self.ensure_server().await?;
        let started = Instant::now();

        let url = format!(
            "http://{}:{port}/{}/{}",
            self.host,
            self.render_type,
            encode_markup(markup)
        );
        let agent = self.agent.clone();
        let content_type = image_content_type(&self.render_type);
        let image = tokio::task::spawn_blocking(move || send_request(&agent, &url, content_type))
            .await
            .map_err(|e| ConvertError::Io(io::Error::other(e)))?
            .map_err(|e| match e {
                ConvertError::Timeout(_) => {
                    ConvertError::Timeout(self.timeout.unwrap_or_default())
                }
                e => e,
            })?;

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
        let mut state = self.state.lock().await;
        if let ServerSlot::Running(mut server) =
            std::mem::replace(&mut state.slot, ServerSlot::Disposed)
        {
            tracing::info!(port = server.port, "Stopping engine service");
            server.child.kill().await.map_err(ConvertError::Pipe)?;
        }
        Ok(())
    }
}
