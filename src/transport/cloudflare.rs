//! Cloudflare quick tunnel process management.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::common::{Result, UploadError};

static QUICK_TUNNEL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("valid quick tunnel regex")
});

/// Extracts the quick tunnel URL from one line of `cloudflared` output.
pub fn find_tunnel_url(line: &str) -> Option<&str> {
    QUICK_TUNNEL_URL.find(line).map(|m| m.as_str())
}

pub fn tunnel_args(local_port: u16) -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--url".to_string(),
        format!("http://127.0.0.1:{local_port}"),
        "--no-autoupdate".to_string(),
    ]
}

/// How the child went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: String,
    /// `true` when the exit followed a terminate/kill request from us.
    pub requested: bool,
}

#[derive(Debug)]
enum ProcessEvent {
    Url(String),
    Exited(ProcessExit),
}

enum Control {
    Terminate {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
    Kill,
}

/// Control handle for a running `cloudflared` child.
///
/// The child itself is owned by a supervisor task; dropping every handle kills it.
#[derive(Clone)]
pub struct TunnelProcess {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Control>,
}

/// Output and exit notifications from one spawned child.
pub struct ProcessEvents {
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl TunnelProcess {
    /// Spawns `binary tunnel --url http://127.0.0.1:<port>` with piped output.
    #[tracing::instrument(skip(binary), fields(binary = %binary.display()))]
    pub fn spawn(binary: &Path, local_port: u16) -> Result<(Self, ProcessEvents)> {
        let args = tunnel_args(local_port);
        info!("Spawning cloudflared {}", args.join(" "));

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| UploadError::ProcessSpawn {
                path: binary.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // cloudflared prints the assigned URL on stderr
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_output(stderr, "stderr", event_tx.clone()));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(scan_output(stdout, "stdout", event_tx.clone()));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(child, control_rx, event_tx));

        Ok((
            Self {
                pid,
                control: control_tx,
            },
            ProcessEvents { rx: event_rx },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Gracefully shuts down the child, escalating to a kill after `grace`.
    pub async fn terminate(&self, grace: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .control
            .send(Control::Terminate {
                grace,
                done: done_tx,
            })
            .is_err()
        {
            // supervisor already gone: child has exited
            return;
        }
        let _ = done_rx.await;
    }

    /// Best-effort kill without waiting.
    pub fn kill(&self) {
        let _ = self.control.send(Control::Kill);
    }
}

impl ProcessEvents {
    /// Waits for the public URL, failing if the child exits first or `timeout` passes.
    pub async fn wait_for_url(&mut self, timeout: Duration) -> Result<String> {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                match event {
                    ProcessEvent::Url(url) => return Ok(url),
                    ProcessEvent::Exited(exit) => return Err(UploadError::ProcessExited(exit.status)),
                }
            }
            Err(UploadError::ProcessExited("supervisor stopped".to_string()))
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| UploadError::TunnelTimeout)?
    }

    /// Resolves once the child has exited.
    pub async fn wait_for_exit(mut self) -> ProcessExit {
        while let Some(event) = self.rx.recv().await {
            if let ProcessEvent::Exited(exit) = event {
                return exit;
            }
        }
        // runtime shutting down; the child is killed on drop
        ProcessExit {
            status: "unknown".to_string(),
            requested: true,
        }
    }
}

async fn supervise(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let exit = tokio::select! {
        status = child.wait() => ProcessExit {
            status: describe(status),
            requested: false,
        },
        command = control.recv() => match command {
            Some(Control::Terminate { grace, done }) => {
                let status = terminate(&mut child, grace).await;
                let _ = done.send(());
                ProcessExit { status, requested: true }
            }
            Some(Control::Kill) | None => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill tunnel process: {}", e);
                }
                ProcessExit {
                    status: describe(child.wait().await),
                    requested: true,
                }
            }
        },
    };

    info!(status = %exit.status, requested = exit.requested, "cloudflared exited");
    let _ = events.send(ProcessEvent::Exited(exit));
}

async fn terminate(child: &mut Child, grace: Duration) -> String {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => describe(status),
        Err(_) => {
            warn!(
                "Tunnel process did not exit after {} ms, killing",
                grace.as_millis()
            );
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill tunnel process: {}", e);
            }
            describe(child.wait().await)
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        // failed signal often means the process is already dead
        warn!("Failed to send SIGTERM to tunnel process: {}", e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop tunnel process: {}", e);
    }
}

fn describe(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

// cloudflared uses stderr for both logs and errors
async fn scan_output<R>(reader: R, stream: &'static str, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut announced = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read cloudflared {}: {}", stream, e);
                break;
            }
        }
        // keep draining the pipe past bytes that are not UTF-8
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();

        let lowercase_line = line.to_lowercase();
        if lowercase_line.contains("error") || lowercase_line.contains("fatal") {
            tracing::error!("cloudflared {}: {}", stream, line);
        } else {
            debug!("cloudflared {}: {}", stream, line);
        }

        if announced {
            continue;
        }
        if let Some(url) = find_tunnel_url(line) {
            info!(url, "Quick tunnel URL assigned");
            announced = true;
            let _ = events.send(ProcessEvent::Url(url.to_string()));
        }
    }
}
