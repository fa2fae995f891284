use std::{process::ExitStatus, sync::Arc, time::Instant};

use anyhow::Context;
use hearth_process::{ServerState, ServerStatus, TunnelStatus};
use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{Mutex, mpsc, watch},
};

use crate::config_store::{ConfigStore, ServerConfig};
use crate::log_buffer::{LogBuffer, LogSink, LogSubscription};
use crate::log_classifier::classify;
use crate::log_file::spawn_console_mirror;
use crate::minecraft::{SHUTDOWN_COMMAND, launch_args, write_server_files};
use crate::process_manager_support::{
    AgentSettings, OutputLines, format_error_chain, unix_ms_now,
};
use crate::tunnel::TunnelManager;
use crate::world_guard::{DecisionReason, WorldDecision, WorldGuard};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("server is {0}; commands are accepted only while online")]
    NotOnline(ServerState),
    #[error("failed to write to server input: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    /// Nothing was done; the server is already in this state.
    AlreadyActive(ServerState),
}

#[derive(Debug)]
enum ServerEvent {
    Line(String),
    Exited(std::io::Result<ExitStatus>),
}

/// Feeds one output stream into the run's event loop until EOF.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::UnboundedSender<ServerEvent>) {
    let mut lines = OutputLines::new(stream);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(ServerEvent::Line(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "server output stream failed");
                break;
            }
        }
    }
}

#[derive(Debug)]
struct Runtime {
    state: ServerState,
    run_id: u64,
    pid: Option<u32>,
    started_at: Option<(u64, Instant)>,
    last_exit_code: Option<i32>,
}

impl Runtime {
    fn set_state(&mut self, state: ServerState, tx: &watch::Sender<ServerState>) {
        self.state = state;
        tx.send_replace(state);
    }
}

#[derive(Debug)]
struct Shared {
    settings: AgentSettings,
    config: Arc<ConfigStore>,
    guard: WorldGuard,
    sink: LogSink,
    tunnel: TunnelManager,
    // Held across start/stop/send_command and exit handling; owns the child's input.
    control: Mutex<Option<ChildStdin>>,
    // Short critical sections only, so status polling never waits on a spawn.
    runtime: Mutex<Runtime>,
    state_tx: watch::Sender<ServerState>,
}

#[derive(Clone, Debug)]
pub struct ServerManager {
    inner: Arc<Shared>,
}

impl ServerManager {
    pub fn new(settings: AgentSettings, config: Arc<ConfigStore>, buffer: Arc<LogBuffer>) -> Self {
        let mut sink = LogSink::new(buffer);
        if let Some(console) = &settings.console_log {
            sink = sink.with_file_mirror(spawn_console_mirror(console));
        }
        if let Some(warning) = config.take_load_warning() {
            sink.warn(warning);
        }

        let guard = WorldGuard::new(
            config.clone(),
            settings.server_dir.clone(),
            settings.backup_dir.clone(),
        );
        let tunnel = TunnelManager::new(settings.tunnel.clone(), sink.clone());
        let (state_tx, _) = watch::channel(ServerState::Offline);

        Self {
            inner: Arc::new(Shared {
                settings,
                config,
                guard,
                sink,
                tunnel,
                control: Mutex::new(None),
                runtime: Mutex::new(Runtime {
                    state: ServerState::Offline,
                    run_id: 0,
                    pid: None,
                    started_at: None,
                    last_exit_code: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn subscribe_logs(&self) -> LogSubscription {
        self.inner.sink.buffer().subscribe()
    }

    /// Receives every lifecycle transition.
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state_tx.subscribe()
    }

    pub async fn get_status(&self) -> ServerStatus {
        let (state, pid, started_at, last_exit_code) = {
            let rt = self.inner.runtime.lock().await;
            (rt.state, rt.pid, rt.started_at, rt.last_exit_code)
        };
        let tunnel: TunnelStatus = self.inner.tunnel.status().await;

        ServerStatus {
            state,
            ready: state == ServerState::Online,
            pid,
            started_at_unix_ms: started_at.map(|(ms, _)| ms),
            uptime_secs: started_at.map(|(_, at)| at.elapsed().as_secs()),
            last_exit_code,
            tunnel,
        }
    }

    pub async fn start(&self) -> anyhow::Result<StartOutcome> {
        let mut control = self.inner.control.lock().await;
        {
            let rt = self.inner.runtime.lock().await;
            if rt.state != ServerState::Offline {
                tracing::info!(state = %rt.state, "start ignored: server already active");
                return Ok(StartOutcome::AlreadyActive(rt.state));
            }
        }

        let sink = &self.inner.sink;
        sink.info("Starting server...");

        // Must finish before the spawn: the world belongs to the guard until then.
        let guard = self.inner.guard.clone();
        let decision = tokio::task::spawn_blocking(move || guard.evaluate_current())
            .await
            .context("world check task panicked")?;
        self.report_world_decision(&decision);

        let config: ServerConfig = self.inner.config.snapshot();
        let settings = &self.inner.settings;
        if let Err(e) = write_server_files(&settings.server_dir, &config) {
            let msg = format_error_chain(&e);
            tracing::error!(error = %msg, "failed to write server files");
            sink.error(format!("Failed to prepare server files: {msg}"));
            return Err(e);
        }

        let (args, warnings) = launch_args(&settings.java, &settings.server_jar, &config);
        for w in warnings {
            tracing::warn!("{w}");
            sink.warn(w);
        }

        let mut cmd = Command::new(&settings.java.program);
        cmd.args(&args)
            .current_dir(&settings.server_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(program = %settings.java.program, error = %e, "server spawn failed");
                sink.error(format!("Failed to launch server: {e}"));
                return Err(anyhow::Error::new(e)
                    .context(format!("spawn {}", settings.java.program)));
            }
        };

        let pid = child.id();
        *control = child.stdin.take();
        let run_id = {
            let mut rt = self.inner.runtime.lock().await;
            rt.run_id = rt.run_id.wrapping_add(1);
            rt.pid = pid;
            rt.started_at = Some((unix_ms_now(), Instant::now()));
            rt.last_exit_code = None;
            rt.set_state(ServerState::Starting, &self.inner.state_tx);
            rt.run_id
        };
        tracing::info!(?pid, run_id, "server process spawned");

        let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(tokio::spawn(forward_lines(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(tokio::spawn(forward_lines(err, tx)));
        }
        tokio::spawn(async move {
            let res = child.wait().await;
            // Drain output first so the exit notice lands after the last line.
            for r in readers {
                let _ = r.await;
            }
            let _ = tx.send(ServerEvent::Exited(res));
        });
        tokio::spawn(self.clone().run_events(run_id, rx));

        // Still under the control lock, so an immediate exit can't slip in before this.
        if config.tunnel.auto_start && self.inner.tunnel.is_installed() {
            self.inner.tunnel.start().await;
        }

        Ok(StartOutcome::Started { pid })
    }

    /// Requests a graceful shutdown; the state reaches Offline when the process exits.
    pub async fn stop(&self) -> bool {
        let mut control = self.inner.control.lock().await;
        {
            let mut rt = self.inner.runtime.lock().await;
            if !matches!(rt.state, ServerState::Starting | ServerState::Online) {
                return false;
            }
            rt.set_state(ServerState::Stopping, &self.inner.state_tx);
        }

        self.inner.sink.info("Stopping server...");
        self.inner.tunnel.stop().await;

        match control.take() {
            Some(mut stdin) => {
                let line = format!("{SHUTDOWN_COMMAND}\n");
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %e, "failed to send shutdown command");
                    self.inner
                        .sink
                        .warn(format!("Failed to send shutdown command: {e}"));
                }
                let _ = stdin.flush().await;
                // Dropped here: the process also sees EOF on its input.
            }
            None => {
                tracing::warn!("server input already closed; waiting for exit");
            }
        }
        true
    }

    pub async fn send_command(&self, text: &str) -> Result<(), CommandError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CommandError::Empty);
        }

        let mut control = self.inner.control.lock().await;
        let state = self.inner.runtime.lock().await.state;
        if state != ServerState::Online {
            return Err(CommandError::NotOnline(state));
        }
        let Some(stdin) = control.as_mut() else {
            return Err(CommandError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "server input is closed",
            )));
        };

        stdin.write_all(format!("{text}\n").as_bytes()).await?;
        stdin.flush().await?;
        self.inner.sink.info(format!("> {text}"));
        Ok(())
    }

    /// Manual tunnel start; only allowed alongside a live server.
    pub async fn start_tunnel(&self) -> bool {
        let _control = self.inner.control.lock().await;
        let state = self.inner.runtime.lock().await.state;
        if !matches!(state, ServerState::Starting | ServerState::Online) {
            self.inner
                .sink
                .warn(format!("Tunnel can only run while the server is up (server is {state})"));
            return false;
        }
        self.inner.tunnel.start().await
    }

    pub async fn stop_tunnel(&self) -> bool {
        self.inner.tunnel.stop().await
    }

    fn report_world_decision(&self, decision: &WorldDecision) {
        let sink = &self.inner.sink;
        match decision.reason {
            DecisionReason::NoWorldExists => {
                sink.info("No world found; a new world will be generated");
            }
            DecisionReason::SeedChanged => {
                let name = decision.backup_name.as_deref().unwrap_or("backup");
                sink.success(format!(
                    "Seed changed; previous world saved as {name}, generating a new world"
                ));
            }
            DecisionReason::SeedUnchanged => {
                tracing::debug!("seed unchanged; reusing world");
            }
            DecisionReason::BackupFailed => {
                let err = decision.error.as_deref().unwrap_or("unknown error");
                sink.error(format!(
                    "World backup failed; keeping the existing world: {err}"
                ));
            }
        }
        if let Some(err) = &decision.tracking_error {
            sink.warn(format!("Failed to save world tracking: {err}"));
        }
    }

    async fn run_events(self, run_id: u64, mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::Line(line) => self.handle_line(run_id, line).await,
                ServerEvent::Exited(res) => self.handle_exit(run_id, res).await,
            }
        }
    }

    async fn handle_line(&self, run_id: u64, line: String) {
        if line.trim().is_empty() {
            return;
        }
        let class = classify(&line);

        // Transition first, so nothing caused by it can be observed before it.
        let became_online = class.marks_ready() && {
            let mut rt = self.inner.runtime.lock().await;
            if rt.run_id == run_id && rt.state == ServerState::Starting {
                rt.set_state(ServerState::Online, &self.inner.state_tx);
                true
            } else {
                false
            }
        };

        self.inner.sink.emit_classified(class, &line);

        if became_online {
            let guard = self.inner.guard.clone();
            match tokio::task::spawn_blocking(move || guard.mark_generated()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.inner
                        .sink
                        .warn(format!("Failed to save world tracking: {e}"));
                }
                Err(e) => tracing::warn!(error = %e, "mark generated task failed"),
            }
            tracing::info!(run_id, "server online");
            self.inner.sink.success("Server is online");
        }
    }

    async fn handle_exit(&self, run_id: u64, res: std::io::Result<ExitStatus>) {
        let mut control = self.inner.control.lock().await;
        let code = {
            let mut rt = self.inner.runtime.lock().await;
            if rt.run_id != run_id {
                return;
            }
            let code = res.as_ref().ok().and_then(|s| s.code());
            rt.pid = None;
            rt.started_at = None;
            rt.last_exit_code = code;
            rt.set_state(ServerState::Offline, &self.inner.state_tx);
            code
        };
        *control = None;
        self.inner.tunnel.force_idle().await;
        drop(control);

        let sink = &self.inner.sink;
        match (&res, code) {
            (Ok(_), Some(0)) => {
                tracing::info!(run_id, "server exited cleanly");
                sink.info("Server stopped normally");
            }
            (Ok(_), Some(code)) => {
                tracing::error!(run_id, code, "server crashed");
                sink.error(format!("Server crashed (exit code {code})"));
            }
            (Ok(_), None) => {
                tracing::error!(run_id, "server terminated by signal");
                sink.error("Server crashed (terminated by signal)");
            }
            (Err(e), _) => {
                tracing::error!(run_id, error = %e, "failed to wait on server process");
                sink.error(format!("Server crashed (wait failed: {e})"));
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process_manager_support::CommandLine;
    use hearth_process::{LogCategory, TunnelState};
    use std::{path::Path, time::Duration};

    const FAKE_SERVER: &str = r#"
echo "[Server thread/INFO]: Starting minecraft server version 1.20.4"
echo "[Server thread/INFO]: Preparing level \"world\""
echo "[Server thread/INFO]: Done (0.321s)! For help, type \"help\""
while read -r line; do
  if [ "$line" = "stop" ]; then
    echo "[Server thread/INFO]: Stopping server"
    exit 0
  fi
  echo "[Server thread/INFO]: got $line"
done
exit 0
"#;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    fn fake_settings(dir: &Path, server_body: &str, tunnel: Option<CommandLine>) -> AgentSettings {
        let script = write_script(dir, "fake-server.sh", server_body);
        let mut settings = AgentSettings::for_data_root(&dir.join("data"));
        settings.java = CommandLine::new("sh", vec![script]);
        settings.tunnel = tunnel;
        settings
    }

    fn manager_from(settings: AgentSettings) -> (ServerManager, Arc<LogBuffer>) {
        let config = Arc::new(ConfigStore::open(settings.config_path.clone()));
        let buffer = Arc::new(LogBuffer::default());
        (ServerManager::new(settings, config, buffer.clone()), buffer)
    }

    fn manager_with(
        dir: &Path,
        server_body: &str,
        tunnel: Option<CommandLine>,
    ) -> (ServerManager, Arc<LogBuffer>) {
        manager_from(fake_settings(dir, server_body, tunnel))
    }

    fn java_tunnel() -> CommandLine {
        CommandLine::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'myaddr.playit.gg => 127.0.0.1:25565'; exec sleep 30".to_string(),
            ],
        )
    }

    async fn wait_for_java_address(manager: &ServerManager) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.get_status().await.tunnel.java_address.is_none() {
            assert!(tokio::time::Instant::now() < deadline, "tunnel binding never seen");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for(manager: &ServerManager, want: ServerState) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("server never reached {want}"))
            .unwrap();
    }

    fn has_entry(buffer: &LogBuffer, category: LogCategory, needle: &str) -> bool {
        buffer
            .snapshot()
            .iter()
            .any(|e| e.category == category && e.message.contains(needle))
    }

    async fn wait_for_entry(buffer: &LogBuffer, category: LogCategory, needle: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !has_entry(buffer, category, needle) {
            assert!(tokio::time::Instant::now() < deadline, "no {category} entry with {needle:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn start_ready_stop_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffer) = manager_with(dir.path(), FAKE_SERVER, Some(java_tunnel()));

        let outcome = manager.start().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { pid: Some(_) }));
        wait_for(&manager, ServerState::Online).await;
        // The summary follows the world update.
        wait_for_entry(&buffer, LogCategory::Success, "online").await;

        let status = manager.get_status().await;
        assert!(status.ready);
        assert!(status.started_at_unix_ms.is_some());
        assert!(manager.config().snapshot().world.world_generated);
        assert!(
            dir.path()
                .join("data")
                .join("server")
                .join("server.properties")
                .exists()
        );

        wait_for_java_address(&manager).await;

        manager.send_command("say hi").await.unwrap();

        assert!(manager.stop().await);
        wait_for(&manager, ServerState::Offline).await;

        let status = manager.get_status().await;
        assert_eq!(status.last_exit_code, Some(0));
        assert!(status.started_at_unix_ms.is_none());
        assert!(status.pid.is_none());
        assert_ne!(status.tunnel.state, TunnelState::Running);
        assert!(status.tunnel.java_address.is_none());
        assert!(status.tunnel.bedrock_address.is_none());
        wait_for_entry(&buffer, LogCategory::Info, "stopped normally").await;
    }

    #[tokio::test]
    async fn online_transition_precedes_its_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _buffer) = manager_with(dir.path(), FAKE_SERVER, None);
        let mut sub = manager.subscribe_logs();

        manager.start().await.unwrap();
        loop {
            let entry = tokio::time::timeout(Duration::from_secs(10), sub.recv())
                .await
                .unwrap()
                .unwrap();
            if entry.message.contains("startup complete") {
                assert_eq!(manager.get_status().await.state, ServerState::Online);
                break;
            }
        }

        manager.stop().await;
        wait_for(&manager, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let body = "echo booting; while read -r line; do [ \"$line\" = stop ] && exit 0; done";
        let (manager, _buffer) = manager_with(dir.path(), body, None);

        let first = manager.start().await.unwrap();
        let second = manager.start().await.unwrap();
        assert!(matches!(first, StartOutcome::Started { .. }));
        assert_eq!(second, StartOutcome::AlreadyActive(ServerState::Starting));

        let status = manager.get_status().await;
        assert_eq!(status.state, ServerState::Starting);
        let StartOutcome::Started { pid } = first else {
            unreachable!()
        };
        assert_eq!(status.pid, pid);

        assert!(manager.stop().await);
        wait_for(&manager, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn stop_and_commands_need_a_live_server() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _buffer) = manager_with(dir.path(), FAKE_SERVER, None);

        assert!(!manager.stop().await);
        assert_eq!(manager.get_status().await.state, ServerState::Offline);

        assert!(matches!(
            manager.send_command("list").await,
            Err(CommandError::NotOnline(ServerState::Offline))
        ));
        assert!(matches!(
            manager.send_command("   ").await,
            Err(CommandError::Empty)
        ));
        assert!(!manager.start_tunnel().await);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffer) = manager_with(dir.path(), "echo oops; exit 3", None);

        manager.start().await.unwrap();
        wait_for(&manager, ServerState::Offline).await;

        let status = manager.get_status().await;
        assert_eq!(status.last_exit_code, Some(3));
        wait_for_entry(&buffer, LogCategory::Error, "crashed").await;
        assert!(!manager.config().snapshot().world.world_generated);
    }

    #[tokio::test]
    async fn spawn_failure_stays_offline() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AgentSettings::for_data_root(dir.path());
        settings.java = CommandLine::new("/nonexistent/hearth-test-java", Vec::new());
        let config = Arc::new(ConfigStore::open(settings.config_path.clone()));
        let buffer = Arc::new(LogBuffer::default());
        let manager = ServerManager::new(settings, config, buffer.clone());

        assert!(manager.start().await.is_err());
        assert_eq!(manager.get_status().await.state, ServerState::Offline);
        assert!(has_entry(&buffer, LogCategory::Error, "Failed to launch"));
    }

    #[tokio::test]
    async fn undecodable_output_does_not_stall_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"
printf 'Caf\351 plugin loaded\n'
printf 'Caf\351 on stderr\n' >&2
echo "[Server thread/INFO]: Done (0.2s)! For help, type \"help\""
while read -r line; do
  [ "$line" = stop ] && exit 0
done
exit 0
"#;
        let (manager, buffer) = manager_with(dir.path(), body, None);

        manager.start().await.unwrap();
        wait_for(&manager, ServerState::Online).await;
        wait_for_entry(&buffer, LogCategory::Info, "Caf\u{FFFD} plugin loaded").await;
        wait_for_entry(&buffer, LogCategory::Info, "Caf\u{FFFD} on stderr").await;

        assert!(manager.stop().await);
        wait_for(&manager, ServerState::Offline).await;
        assert_eq!(manager.get_status().await.last_exit_code, Some(0));
    }

    #[tokio::test]
    async fn unsaved_world_tracking_is_logged_as_warning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let mut settings = fake_settings(dir.path(), FAKE_SERVER, None);
        settings.config_path = blocker.join("config.json");
        let (manager, buffer) = manager_from(settings);

        manager.start().await.unwrap();
        wait_for(&manager, ServerState::Online).await;
        wait_for_entry(&buffer, LogCategory::Success, "Server is online").await;

        // One for the pre-start tracking, one for the generated flag.
        let warnings = buffer
            .snapshot()
            .into_iter()
            .filter(|e| {
                e.category == LogCategory::Warn && e.message.contains("Failed to save world tracking")
            })
            .count();
        assert_eq!(warnings, 2);

        manager.stop().await;
        wait_for(&manager, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn seed_change_backs_up_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffer) = manager_with(dir.path(), FAKE_SERVER, None);
        let server_dir = dir.path().join("data").join("server");
        let world = server_dir.join("world");
        std::fs::create_dir_all(world.join("region")).unwrap();
        std::fs::write(world.join("level.dat"), b"old level").unwrap();
        std::fs::write(world.join("region").join("r.0.0.mca"), vec![3u8; 512]).unwrap();
        manager
            .config()
            .update(|cfg| {
                cfg.server.seed = "new".to_string();
                cfg.world.last_used_seed = "old".to_string();
                cfg.world.world_generated = true;
            })
            .unwrap();

        manager.start().await.unwrap();
        wait_for(&manager, ServerState::Online).await;

        let backups: Vec<_> = std::fs::read_dir(&server_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("world_backup_"))
            })
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(backups[0].join("level.dat")).unwrap(), b"old level");
        assert_eq!(
            std::fs::read(backups[0].join("region").join("r.0.0.mca")).unwrap(),
            vec![3u8; 512]
        );
        assert_eq!(manager.config().snapshot().world.last_used_seed, "new");

        let entries = buffer.snapshot();
        let saved = entries
            .iter()
            .position(|e| {
                e.category == LogCategory::Success && e.message.contains("previous world saved")
            })
            .expect("backup notice");
        let first_output = entries
            .iter()
            .position(|e| e.raw.contains("Starting minecraft server version"))
            .expect("process output");
        assert!(saved < first_output);

        manager.stop().await;
        wait_for(&manager, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn crash_forces_running_tunnel_idle() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"
echo "[Server thread/INFO]: Done (0.1s)! For help, type \"help\""
read -r line
exit 3
"#;
        let (manager, buffer) = manager_with(dir.path(), body, Some(java_tunnel()));

        manager.start().await.unwrap();
        wait_for(&manager, ServerState::Online).await;
        wait_for_java_address(&manager).await;
        assert_eq!(manager.get_status().await.tunnel.state, TunnelState::Running);

        manager.send_command("crash").await.unwrap();
        wait_for(&manager, ServerState::Offline).await;

        let status = manager.get_status().await;
        assert_eq!(status.last_exit_code, Some(3));
        assert_eq!(status.tunnel.state, TunnelState::Idle);
        assert!(status.tunnel.java_address.is_none());
        assert!(status.tunnel.bedrock_address.is_none());
        wait_for_entry(&buffer, LogCategory::Error, "crashed").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_starts_spawn_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let body = "echo booting; while read -r line; do [ \"$line\" = stop ] && exit 0; done";
        let (manager, _buffer) = manager_with(dir.path(), body, None);

        let a = tokio::spawn({
            let m = manager.clone();
            async move { m.start().await.unwrap() }
        });
        let b = tokio::spawn({
            let m = manager.clone();
            async move { m.start().await.unwrap() }
        });
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let started: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                StartOutcome::Started { pid } => Some(*pid),
                StartOutcome::AlreadyActive(_) => None,
            })
            .collect();
        assert_eq!(started.len(), 1);
        assert!(
            outcomes
                .iter()
                .any(|o| *o == StartOutcome::AlreadyActive(ServerState::Starting))
        );
        assert_eq!(manager.get_status().await.pid, started[0]);

        assert!(manager.stop().await);
        wait_for(&manager, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn manual_tunnel_follows_server_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _buffer) = manager_with(dir.path(), FAKE_SERVER, Some(java_tunnel()));
        manager
            .config()
            .update(|cfg| cfg.tunnel.auto_start = false)
            .unwrap();

        assert!(!manager.start_tunnel().await);
        assert_eq!(manager.get_status().await.tunnel.state, TunnelState::Idle);

        manager.start().await.unwrap();
        wait_for(&manager, ServerState::Online).await;
        assert_eq!(manager.get_status().await.tunnel.state, TunnelState::Idle);

        assert!(manager.start_tunnel().await);
        wait_for_java_address(&manager).await;

        assert!(manager.stop().await);
        wait_for(&manager, ServerState::Offline).await;
        let tunnel = manager.get_status().await.tunnel;
        assert_eq!(tunnel.state, TunnelState::Idle);
        assert!(tunnel.java_address.is_none());
    }
}
