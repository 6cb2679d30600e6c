//! Runtime launchers: spawning a browser and extracting its DevTools
//! endpoint, attaching to a running one, and the named-pipe discovery server
//! that Node-like runtimes dial back into.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use jsdbg_cdp::{connect_websocket, probe_websocket_url, CdpConnection, CdpTransport, StreamTransport};

use crate::config::LaunchConfig;
use crate::error::AdapterError;

const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(0);

/// A connected runtime plus the child process that backs it, when launched
/// rather than attached.
pub struct LaunchedRuntime {
    pub connection: Arc<CdpConnection>,
    child: Option<Child>,
    _profile_dir: Option<tempfile::TempDir>,
}

impl LaunchedRuntime {
    pub fn from_parts(connection: Arc<CdpConnection>, child: Option<Child>) -> Self {
        Self {
            connection,
            child,
            _profile_dir: None,
        }
    }

    pub async fn kill(&mut self) {
        self.connection.close();
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "adapter", %err, "failed to kill runtime child");
            }
        }
    }
}

/// Spawn a browser and connect to the DevTools endpoint it announces on
/// stderr.
pub async fn launch_browser(config: &LaunchConfig) -> Result<LaunchedRuntime, AdapterError> {
    let executable = resolve_browser_executable(config)?;
    let profile_dir = tempfile::TempDir::with_prefix("jsdbg-profile-")
        .map_err(|err| AdapterError::Launch(err.to_string()))?;

    let mut command = Command::new(&executable);
    command
        .arg("--remote-debugging-port=0")
        .arg(format!("--user-data-dir={}", profile_dir.path().display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-networking")
        .arg("--disable-popup-blocking")
        .arg("--remote-allow-origins=*")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if config.headless.unwrap_or(false) {
        command.arg("--headless=new").arg("--mute-audio");
    }
    if let Some(args) = &config.args {
        command.args(args);
    }
    if let Some(url) = &config.url {
        command.arg(url);
    }

    let mut child = command
        .spawn()
        .map_err(|err| AdapterError::Launch(format!("failed to spawn {executable:?}: {err}")))?;
    let ws_url = extract_ws_url(&mut child, config.connect_timeout()).await?;
    info!(target: "adapter", url = %ws_url, "browser devtools endpoint up");

    let transport = connect_websocket(&ws_url).await?;
    Ok(LaunchedRuntime {
        connection: CdpConnection::new(Arc::new(transport)),
        child: Some(child),
        _profile_dir: Some(profile_dir),
    })
}

/// Connect to an already-running runtime, either directly by WebSocket URL or
/// by probing its `/json/version` endpoint.
pub async fn attach_runtime(config: &LaunchConfig) -> Result<LaunchedRuntime, AdapterError> {
    let ws_url = match (&config.ws_url, config.port) {
        (Some(url), _) => url.clone(),
        (None, Some(port)) => {
            timeout(
                config.connect_timeout(),
                probe_websocket_url(config.host(), port),
            )
            .await
            .map_err(|_| AdapterError::Launch("timed out probing /json/version".into()))??
        }
        (None, None) => {
            return Err(AdapterError::Config(
                "attach requires \"wsUrl\" or \"port\"".into(),
            ))
        }
    };
    let transport = connect_websocket(&ws_url).await?;
    Ok(LaunchedRuntime {
        connection: CdpConnection::new(Arc::new(transport)),
        child: None,
        _profile_dir: None,
    })
}

/// Read the child's stderr until the DevTools listening line appears.
async fn extract_ws_url(
    child: &mut Child,
    deadline: std::time::Duration,
) -> Result<String, AdapterError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AdapterError::Launch("runtime child has no stderr handle".into()))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut captured = Vec::new();

    let reader = async {
        while let Ok(Some(line)) = lines.next_line().await {
            captured.push(line.clone());
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(AdapterError::Launch(format!(
            "runtime exited before exposing a devtools url. stderr preview: {}",
            captured
                .iter()
                .take(8)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ")
        )))
    };

    timeout(deadline, reader)
        .await
        .map_err(|_| AdapterError::Launch("timed out waiting for the devtools url".into()))?
}

fn resolve_browser_executable(config: &LaunchConfig) -> Result<PathBuf, AdapterError> {
    if let Some(executable) = &config.runtime_executable {
        if !executable.exists() {
            return Err(AdapterError::Launch(format!(
                "runtime executable not found at {}",
                executable.display()
            )));
        }
        return Ok(executable.clone());
    }
    for candidate in BROWSER_CANDIDATES {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    Err(AdapterError::Launch(
        "no browser executable found on PATH; set \"runtimeExecutable\"".into(),
    ))
}

/// The named pipe a Node-like runtime dials back into; every child process
/// that connects yields one CDP connection.
pub struct NodeIpcServer {
    path: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

impl NodeIpcServer {
    pub fn bind() -> Result<Self, AdapterError> {
        let n = NEXT_PIPE_ID.fetch_add(1, Ordering::SeqCst);
        let name = format!("node-cdp.{}-{}.sock", std::process::id(), n);
        #[cfg(unix)]
        {
            let path = std::env::temp_dir().join(name);
            let listener = tokio::net::UnixListener::bind(&path)?;
            debug!(target: "adapter", path = %path.display(), "node ipc server bound");
            Ok(Self { path, listener })
        }
        #[cfg(windows)]
        {
            let path = PathBuf::from(format!(r"\\.\pipe\{name}"));
            Ok(Self { path })
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Environment a spawned runtime needs to find its way back here.
    pub fn child_env(&self, bootloader: Option<&PathBuf>) -> Vec<(String, String)> {
        let mut env = vec![(
            "NODE_INSPECTOR_IPC".to_string(),
            self.path.display().to_string(),
        )];
        if let Some(bootloader) = bootloader {
            env.push((
                "NODE_OPTIONS".to_string(),
                format!("--require {}", bootloader.display()),
            ));
        }
        env
    }

    /// Wait for the next child to dial in.
    #[cfg(unix)]
    pub async fn accept(&self) -> Result<Arc<CdpConnection>, AdapterError> {
        let (stream, _addr) = self.listener.accept().await?;
        let (read, write) = stream.into_split();
        let transport: Arc<dyn CdpTransport> = Arc::new(StreamTransport::pipe(read, write));
        info!(target: "adapter", "node child connected over ipc");
        Ok(CdpConnection::new(transport))
    }

    #[cfg(windows)]
    pub async fn accept(&self) -> Result<Arc<CdpConnection>, AdapterError> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let server = ServerOptions::new()
            .create(&self.path)
            .map_err(AdapterError::Io)?;
        server.connect().await.map_err(AdapterError::Io)?;
        let (read, write) = tokio::io::split(server);
        let transport: Arc<dyn CdpTransport> = Arc::new(StreamTransport::pipe(read, write));
        Ok(CdpConnection::new(transport))
    }
}

#[cfg(unix)]
impl Drop for NodeIpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Spawn the Node-like runtime pointed at the IPC server.
pub fn spawn_node(config: &LaunchConfig, server: &NodeIpcServer) -> Result<Child, AdapterError> {
    let program = config
        .program
        .as_ref()
        .ok_or_else(|| AdapterError::Config("launching node requires \"program\"".into()))?;
    let executable = config
        .runtime_executable
        .clone()
        .unwrap_or_else(|| PathBuf::from("node"));

    let mut command = Command::new(executable);
    command
        .arg(program)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(args) = &config.args {
        command.args(args);
    }
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &config.env {
        command.envs(env);
    }
    command.envs(server.child_env(config.bootloader.as_ref()));

    command
        .spawn()
        .map_err(|err| AdapterError::Launch(format!("failed to spawn node runtime: {err}")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ipc_server_yields_a_connection_per_child() {
        let server = NodeIpcServer::bind().unwrap();
        let path = server.path().clone();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("node-cdp."));

        let dialer = tokio::spawn(async move {
            let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
            let (read, write) = stream.into_split();
            StreamTransport::pipe(read, write)
        });

        let connection = server.accept().await.unwrap();
        let child_transport = dialer.await.unwrap();

        // The accepted endpoint really is a live CDP connection: a request
        // sent through it reaches the child end, framed with `\0`.
        let root = connection.root_session();
        let request = tokio::spawn(async move {
            root.send("Runtime.enable", json!({})).await
        });
        let seen = child_transport.next().await.unwrap();
        assert_eq!(seen["method"], "Runtime.enable");
        child_transport
            .send(json!({"id": seen["id"], "result": {}}))
            .await
            .unwrap();
        request.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn child_env_points_the_runtime_at_the_pipe() {
        let server = NodeIpcServer::bind().unwrap();
        let env = server.child_env(Some(&PathBuf::from("/opt/bootloader.js")));
        assert_eq!(env[0].0, "NODE_INSPECTOR_IPC");
        assert!(env[1].1.contains("--require /opt/bootloader.js"));
    }
}
