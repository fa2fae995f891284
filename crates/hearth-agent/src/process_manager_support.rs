use std::{
    fs,
    path::{Path, PathBuf},
};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn log_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("HEARTH_LOG_FILE_MAX_BYTES")
        .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
    let max_files = env_usize("HEARTH_LOG_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
    (max_bytes, max_files)
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Program plus leading arguments, e.g. `["java"]` or `["sh", "fake-server.sh"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits on whitespace; `None` for a blank string.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// Process-level settings read from the environment at start-up.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub data_root: PathBuf,
    pub config_path: PathBuf,
    /// Working directory of the managed process; the world lives beneath it.
    pub server_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub java: CommandLine,
    pub server_jar: String,
    /// `None` when the tunnel binary was not found at start-up.
    pub tunnel: Option<CommandLine>,
    pub console_log: Option<ConsoleLogSettings>,
}

#[derive(Debug, Clone)]
pub struct ConsoleLogSettings {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_files: usize,
}

impl AgentSettings {
    pub fn from_env() -> Self {
        Self::from_env_in(data_root())
    }

    /// Like `from_env`, with the data root already resolved.
    pub fn from_env_in(data_root: PathBuf) -> Self {
        let mut settings = Self::for_data_root(&data_root);

        if let Some(java) = env_nonempty("HEARTH_JAVA").and_then(|v| CommandLine::parse(&v)) {
            settings.java = java;
        }
        if let Some(jar) = env_nonempty("HEARTH_SERVER_JAR") {
            settings.server_jar = jar;
        }
        settings.backup_dir = env_nonempty("HEARTH_BACKUP_DIR").map(PathBuf::from);

        let tunnel_bin = env_nonempty("HEARTH_TUNNEL_BIN").unwrap_or_else(|| "playit".to_string());
        settings.tunnel = find_tunnel_binary(&tunnel_bin, &data_root);

        let (max_bytes, max_files) = log_file_limits();
        settings.console_log = Some(ConsoleLogSettings {
            path: data_root.join("logs").join("console.log"),
            max_bytes,
            max_files,
        });
        settings
    }

    /// Defaults rooted at `data_root`, with no tunnel and no console mirror.
    pub fn for_data_root(data_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
            config_path: data_root.join("config.json"),
            server_dir: data_root.join("server"),
            backup_dir: None,
            java: CommandLine::new("java", Vec::new()),
            server_jar: "server.jar".to_string(),
            tunnel: None,
            console_log: None,
        }
    }
}

pub fn data_root() -> PathBuf {
    let raw = std::env::var("HEARTH_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

fn find_tunnel_binary(bin: &str, data_root: &Path) -> Option<CommandLine> {
    if command_exists(bin) {
        return Some(CommandLine::new(bin, Vec::new()));
    }
    let bundled = data_root.join("bin").join(bin);
    if is_executable_file(&bundled) {
        return Some(CommandLine::new(bundled.display().to_string(), Vec::new()));
    }
    tracing::info!(bin, "tunnel binary not found; tunnel disabled");
    None
}

pub(crate) fn command_exists(bin: &str) -> bool {
    let path = Path::new(bin);
    if path.components().count() > 1 {
        return is_executable_file(path);
    }

    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(bin);
                is_executable_file(&candidate)
            })
        })
        .unwrap_or(false)
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Line reader for child output. Bytes that are not UTF-8 are replaced
/// instead of ending the stream; only EOF or a read error stops it.
pub(crate) struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(256),
        }
    }

    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

pub(crate) fn unix_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
