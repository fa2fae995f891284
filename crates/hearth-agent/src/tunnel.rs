//! Companion tunnel process: exposes the game ports publicly and reports the
//! assigned addresses on its own output.

use std::{collections::BTreeMap, sync::Arc};

use hearth_process::{TunnelState, TunnelStatus};
use tokio::{io::AsyncRead, process::Command, sync::Mutex};

use crate::log_buffer::LogSink;
use crate::minecraft::{BEDROCK_PORT, JAVA_PORT};
use crate::process_manager_support::{CommandLine, OutputLines};

const BINDING_ARROW: &str = " => ";
const LOCAL_HOST_PREFIX: &str = "127.0.0.1:";
const SETUP_PREFIX: &str = "Visit link to setup ";
const APPROVED_MARKER: &str = "Program approved";

/// What a single output line changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TunnelNotice {
    Binding { port: u16, address: String },
    SetupRequired(String),
    Approved,
}

#[derive(Debug)]
struct TunnelRuntime {
    state: TunnelState,
    generation: u64,
    pid: Option<u32>,
    bindings: BTreeMap<u16, String>,
    setup_url: Option<String>,
    approved: bool,
}

impl TunnelRuntime {
    fn new(installed: bool) -> Self {
        Self {
            state: if installed {
                TunnelState::Idle
            } else {
                TunnelState::NotInstalled
            },
            generation: 0,
            pid: None,
            bindings: BTreeMap::new(),
            setup_url: None,
            approved: false,
        }
    }

    /// Applies one (ANSI-stripped) output line; only real changes are reported.
    fn apply_line(&mut self, line: &str) -> Option<TunnelNotice> {
        if let Some((address, port)) = parse_binding(line) {
            if port != JAVA_PORT && port != BEDROCK_PORT {
                return None;
            }
            if self.bindings.get(&port).map(String::as_str) == Some(address) {
                return None;
            }
            self.bindings.insert(port, address.to_string());
            return Some(TunnelNotice::Binding {
                port,
                address: address.to_string(),
            });
        }

        if let Some(url) = parse_setup_url(line) {
            if self.setup_url.as_deref() == Some(url) {
                return None;
            }
            self.setup_url = Some(url.to_string());
            return Some(TunnelNotice::SetupRequired(url.to_string()));
        }

        if line.contains(APPROVED_MARKER) {
            self.setup_url = None;
            if self.approved {
                return None;
            }
            self.approved = true;
            return Some(TunnelNotice::Approved);
        }

        None
    }

    /// Bindings are provisional: every stop forgets them.
    fn reset(&mut self) {
        self.state = TunnelState::Idle;
        self.generation = self.generation.wrapping_add(1);
        self.pid = None;
        self.bindings.clear();
        self.setup_url = None;
    }

    fn status(&self) -> TunnelStatus {
        TunnelStatus {
            state: self.state,
            java_address: self.bindings.get(&JAVA_PORT).cloned(),
            bedrock_address: self.bindings.get(&BEDROCK_PORT).cloned(),
            setup_url: self.setup_url.clone(),
            approved: self.approved,
        }
    }
}

/// `<address> => 127.0.0.1:<port>`
fn parse_binding(line: &str) -> Option<(&str, u16)> {
    let (left, right) = line.split_once(BINDING_ARROW)?;
    let address = left.split_whitespace().last()?;
    let port_text = right.trim_start().strip_prefix(LOCAL_HOST_PREFIX)?;
    let end = port_text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(port_text.len());
    let port = port_text[..end].parse::<u16>().ok()?;
    Some((address, port))
}

fn parse_setup_url(line: &str) -> Option<&str> {
    let idx = line.find(SETUP_PREFIX)?;
    let url = line[idx + SETUP_PREFIX.len()..].split_whitespace().next()?;
    (url.starts_with("http://") || url.starts_with("https://")).then_some(url)
}

fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // CSI: parameters until a final byte in '@'..='~'.
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

fn port_label(port: u16) -> &'static str {
    if port == BEDROCK_PORT { "Bedrock" } else { "Java" }
}

#[derive(Debug)]
struct TunnelShared {
    command: Option<CommandLine>,
    sink: LogSink,
    runtime: Mutex<TunnelRuntime>,
}

#[derive(Clone, Debug)]
pub struct TunnelManager {
    inner: Arc<TunnelShared>,
}

impl TunnelManager {
    /// `command` is the binary lookup result: `None` means the binary was not found.
    pub fn new(command: Option<CommandLine>, sink: LogSink) -> Self {
        let installed = command.is_some();
        Self {
            inner: Arc::new(TunnelShared {
                command,
                sink,
                runtime: Mutex::new(TunnelRuntime::new(installed)),
            }),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.inner.command.is_some()
    }

    pub async fn status(&self) -> TunnelStatus {
        self.inner.runtime.lock().await.status()
    }

    /// Spawns the tunnel; returns without waiting for any output.
    ///
    /// Crate-private: the server supervisor decides when a tunnel may run.
    pub(crate) async fn start(&self) -> bool {
        let Some(command) = self.inner.command.as_ref() else {
            tracing::warn!("tunnel start requested but the tunnel binary is not installed");
            self.inner
                .sink
                .warn("Tunnel not installed; skipping tunnel start");
            return false;
        };

        let mut rt = self.inner.runtime.lock().await;
        if rt.state == TunnelState::Running {
            tracing::warn!("tunnel already running");
            self.inner.sink.warn("Tunnel is already running");
            return false;
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(program = %command.program, error = %e, "tunnel spawn failed");
                self.inner
                    .sink
                    .warn(format!("Tunnel failed to start: {e}"));
                return false;
            }
        };

        rt.generation = rt.generation.wrapping_add(1);
        rt.state = TunnelState::Running;
        rt.pid = child.id();
        rt.bindings.clear();
        rt.setup_url = None;
        let generation = rt.generation;
        drop(rt);

        tracing::info!(pid = ?child.id(), "tunnel started");
        self.inner.sink.info("Tunnel starting...");

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let manager = self.clone();
            readers.push(tokio::spawn(async move {
                manager.read_output(generation, out).await;
            }));
        }
        if let Some(err) = child.stderr.take() {
            let manager = self.clone();
            readers.push(tokio::spawn(async move {
                manager.read_output(generation, err).await;
            }));
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            for r in readers {
                let _ = r.await;
            }
            manager.on_exit(generation, res).await;
        });

        true
    }

    /// Sends SIGTERM and forgets every binding right away.
    pub(crate) async fn stop(&self) -> bool {
        let mut rt = self.inner.runtime.lock().await;
        let was_running = rt.state == TunnelState::Running;
        let pid = rt.pid;
        if rt.state != TunnelState::NotInstalled {
            rt.reset();
        }
        drop(rt);

        if !was_running {
            return false;
        }
        if let Some(pid) = pid {
            terminate(pid);
        }
        tracing::info!(?pid, "tunnel stopped");
        self.inner.sink.info("Tunnel stopped");
        true
    }

    /// Called when the managed server goes away: tunnel back to Idle, quietly if already there.
    pub(crate) async fn force_idle(&self) {
        let _ = self.stop().await;
    }

    async fn read_output<R: AsyncRead + Unpin>(&self, generation: u64, stream: R) {
        let mut lines = OutputLines::new(stream);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_output(generation, &line).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "tunnel output stream failed");
                    break;
                }
            }
        }
    }

    async fn handle_output(&self, generation: u64, raw: &str) {
        let line = strip_ansi(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        tracing::debug!(target: "hearth_agent::tunnel_output", "{line}");

        let notice = {
            let mut rt = self.inner.runtime.lock().await;
            if rt.generation != generation || rt.state != TunnelState::Running {
                return;
            }
            rt.apply_line(line)
        };

        match notice {
            Some(TunnelNotice::Binding { port, address }) => {
                tracing::info!(port, %address, "tunnel address assigned");
                self.inner
                    .sink
                    .success(format!("{} address: {address}", port_label(port)));
            }
            Some(TunnelNotice::SetupRequired(url)) => {
                tracing::warn!(%url, "tunnel setup required");
                self.inner
                    .sink
                    .warn(format!("Tunnel setup required: visit {url}"));
            }
            Some(TunnelNotice::Approved) => {
                self.inner.sink.success("Tunnel agent approved");
            }
            None => {}
        }
    }

    async fn on_exit(&self, generation: u64, res: std::io::Result<std::process::ExitStatus>) {
        let mut rt = self.inner.runtime.lock().await;
        if rt.generation != generation || rt.state != TunnelState::Running {
            return;
        }
        rt.reset();
        drop(rt);

        let detail = match res {
            Ok(status) => format!("exit code {:?}", status.code()),
            Err(e) => format!("wait failed: {e}"),
        };
        tracing::warn!(%detail, "tunnel exited unexpectedly");
        self.inner
            .sink
            .warn(format!("Tunnel exited unexpectedly ({detail})"));
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: plain kill(2); a stale pid at worst hits nothing we own.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_buffer::LogBuffer;
    use hearth_process::LogCategory;
    use std::time::Duration;

    #[test]
    fn java_binding_leaves_bedrock_untouched() {
        let mut rt = TunnelRuntime::new(true);
        rt.state = TunnelState::Running;
        rt.bindings
            .insert(BEDROCK_PORT, "bedrock.example:19132".to_string());

        let notice = rt.apply_line("myaddr.playit.gg => 127.0.0.1:25565");
        assert_eq!(
            notice,
            Some(TunnelNotice::Binding {
                port: JAVA_PORT,
                address: "myaddr.playit.gg".to_string()
            })
        );
        let st = rt.status();
        assert_eq!(st.java_address.as_deref(), Some("myaddr.playit.gg"));
        assert_eq!(st.bedrock_address.as_deref(), Some("bedrock.example:19132"));
    }

    #[test]
    fn repeated_binding_is_reported_once() {
        let mut rt = TunnelRuntime::new(true);
        let line = "tcp  cool-name.gl.joinmc.link => 127.0.0.1:25565 (minecraft-java)";
        assert!(rt.apply_line(line).is_some());
        assert!(rt.apply_line(line).is_none());
        assert!(rt.apply_line("other.joinmc.link => 127.0.0.1:25565").is_some());
        assert_eq!(
            rt.status().java_address.as_deref(),
            Some("other.joinmc.link")
        );
    }

    #[test]
    fn unknown_ports_and_noise_are_ignored() {
        let mut rt = TunnelRuntime::new(true);
        assert!(rt.apply_line("x.example => 127.0.0.1:8080").is_none());
        assert!(rt.apply_line("x.example => 10.0.0.1:25565").is_none());
        assert!(rt.apply_line("x.example => 127.0.0.1:").is_none());
        assert!(rt.apply_line("starting tunnel agent").is_none());
        assert!(rt.bindings.is_empty());
    }

    #[test]
    fn setup_url_then_approval() {
        let mut rt = TunnelRuntime::new(true);
        let line = "Visit link to setup https://playit.gg/claim/abc123 to continue";
        assert_eq!(
            rt.apply_line(line),
            Some(TunnelNotice::SetupRequired(
                "https://playit.gg/claim/abc123".to_string()
            ))
        );
        assert!(rt.apply_line(line).is_none());
        assert!(rt.bindings.is_empty());

        assert_eq!(rt.apply_line("Program approved :)"), Some(TunnelNotice::Approved));
        assert!(rt.setup_url.is_none());
        assert!(rt.status().approved);
    }

    #[test]
    fn reset_clears_provisional_state() {
        let mut rt = TunnelRuntime::new(true);
        rt.state = TunnelState::Running;
        rt.apply_line("a.example => 127.0.0.1:19132");
        rt.apply_line("Visit link to setup https://playit.gg/claim/x");
        let generation = rt.generation;
        rt.reset();
        let st = rt.status();
        assert_eq!(st.state, TunnelState::Idle);
        assert!(st.bedrock_address.is_none());
        assert!(st.setup_url.is_none());
        assert_ne!(rt.generation, generation);
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        assert_eq!(
            strip_ansi("\u{1b}[1;32mgreen.example\u{1b}[0m => 127.0.0.1:25565"),
            "green.example => 127.0.0.1:25565"
        );
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[tokio::test]
    async fn start_without_binary_is_a_warning_noop() {
        let buffer = Arc::new(LogBuffer::default());
        let tunnel = TunnelManager::new(None, LogSink::new(buffer.clone()));
        assert!(!tunnel.start().await);
        assert_eq!(tunnel.status().await.state, TunnelState::NotInstalled);
        assert_eq!(buffer.snapshot()[0].category, LogCategory::Warn);
        assert!(!tunnel.stop().await);
        assert_eq!(tunnel.status().await.state, TunnelState::NotInstalled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_output_populates_bindings_until_stop() {
        let buffer = Arc::new(LogBuffer::default());
        let script = "echo 'myaddr.playit.gg => 127.0.0.1:25565'; \
                      echo 'myaddr.playit.gg => 127.0.0.1:25565'; \
                      exec sleep 30";
        let command = CommandLine::new("sh", vec!["-c".to_string(), script.to_string()]);
        let tunnel = TunnelManager::new(Some(command), LogSink::new(buffer.clone()));

        assert!(tunnel.start().await);
        assert!(!tunnel.start().await, "second start must be refused");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let st = tunnel.status().await;
            if st.java_address.is_some() {
                assert_eq!(st.java_address.as_deref(), Some("myaddr.playit.gg"));
                assert!(st.bedrock_address.is_none());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "binding never observed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(tunnel.stop().await);
        let st = tunnel.status().await;
        assert_eq!(st.state, TunnelState::Idle);
        assert!(st.java_address.is_none());

        let binding_logs = buffer
            .snapshot()
            .into_iter()
            .filter(|e| e.message.contains("myaddr.playit.gg"))
            .count();
        assert_eq!(binding_logs, 1);
    }
}
