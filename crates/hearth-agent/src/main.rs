use std::{path::Path, sync::Arc};

use hearth_agent::config_store::ConfigStore;
use hearth_agent::log_buffer::LogBuffer;
use hearth_agent::process_manager::{ServerManager, StartOutcome};
use hearth_agent::process_manager_support::{AgentSettings, data_root, format_error_chain};
use hearth_process::{LogEntry, ServerState};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Stdout plus a daily file under `<data_root>/logs/`; `RUST_LOG` wins over the `info` default.
fn init_tracing(data_root: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false).compact();

    let log_dir = data_root.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log dir {}: {e}", log_dir.display());
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout)
            .try_init()
            .ok();
        return None;
    }

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "hearth-agent"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .try_init()
        .ok();
    Some(guard)
}

fn print_entry(entry: &LogEntry) {
    println!("[{}] {}", entry.category, entry.message);
}

const HELP: &str = "commands: :start  :stop  :status  :logs  :tunnel start|stop  :quit  (anything else is sent to the server)";

/// Returns false when the console should exit.
async fn handle_console_line(manager: &ServerManager, line: &str) -> bool {
    let line = line.trim();
    match line {
        "" => {}
        ":help" => println!("{HELP}"),
        ":start" => match manager.start().await {
            Ok(StartOutcome::Started { pid }) => tracing::info!(?pid, "server starting"),
            Ok(StartOutcome::AlreadyActive(state)) => println!("server is already {state}"),
            Err(e) => eprintln!("start failed: {}", format_error_chain(&e)),
        },
        ":stop" => {
            if !manager.stop().await {
                println!("server is not running");
            }
        }
        ":status" => {
            let status = manager.get_status().await;
            match serde_json::to_string_pretty(&status) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("status unavailable: {e}"),
            }
        }
        ":logs" => {
            for entry in manager.subscribe_logs().replay() {
                print_entry(entry);
            }
        }
        ":tunnel start" => {
            manager.start_tunnel().await;
        }
        ":tunnel stop" => {
            if !manager.stop_tunnel().await {
                println!("tunnel is not running");
            }
        }
        ":quit" | ":exit" => return false,
        other if other.starts_with(':') => println!("unknown command; {HELP}"),
        command => {
            if let Err(e) = manager.send_command(command).await {
                println!("{e}");
            }
        }
    }
    true
}

async fn shutdown(manager: &ServerManager) {
    if manager.stop().await {
        tracing::info!("waiting for the server to stop");
        let mut state = manager.watch_state();
        let _ = state.wait_for(|s| *s == ServerState::Offline).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing first: building the settings looks up the tunnel binary and logs the result.
    let root = data_root();
    let _log_guard = init_tracing(&root);
    let settings = AgentSettings::from_env_in(root);

    tracing::info!(
        data_root = %settings.data_root.display(),
        tunnel = settings.tunnel.is_some(),
        "hearth-agent starting"
    );

    let config = Arc::new(ConfigStore::open(settings.config_path.clone()));
    let buffer = Arc::new(LogBuffer::default());
    let manager = ServerManager::new(settings, config, buffer);

    let mut logs = manager.subscribe_logs();
    for entry in logs.take_replay() {
        print_entry(&entry);
    }
    tokio::spawn(async move {
        while let Some(entry) = logs.recv().await {
            print_entry(&entry);
        }
    });

    println!("{HELP}");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_console_line(&manager, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "console input failed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    shutdown(&manager).await;
    tracing::info!("hearth-agent exiting");
    Ok(())
}
