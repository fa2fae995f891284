use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt, sync::mpsc};

use crate::process_manager_support::ConsoleLogSettings;

/// `console.log` -> `console.log.3`
fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Drops the oldest generation and moves the rest up by one, freeing `path`.
async fn shift_generations(path: &Path, keep: usize) {
    let _ = fs::remove_file(numbered(path, keep)).await;
    for n in (1..keep).rev() {
        let _ = fs::rename(numbered(path, n), numbered(path, n + 1)).await;
    }
    let _ = fs::rename(path, numbered(path, 1)).await;
}

/// The console mirror on disk: one line per log entry, rolled over once it
/// would grow past `max_bytes`. The file is opened on first use.
pub(crate) struct ConsoleFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    size: u64,
    file: Option<fs::File>,
}

impl ConsoleFile {
    pub(crate) fn new(settings: &ConsoleLogSettings) -> Self {
        Self {
            path: settings.path.clone(),
            max_bytes: settings.max_bytes,
            keep: settings.max_files.max(1),
            size: 0,
            file: None,
        }
    }

    async fn file(&mut self) -> std::io::Result<&mut fs::File> {
        if self.file.is_none() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir).await?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            self.file = Some(file);
        }
        // Just populated above.
        self.file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("console log not open"))
    }

    pub(crate) async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let line = line.trim_end_matches('\n');
        let len = line.len() as u64 + 1;

        self.file().await?;
        // A single oversized line still goes into a fresh file rather than looping.
        if self.max_bytes > 0 && self.size > 0 && self.size + len > self.max_bytes {
            if let Some(mut old) = self.file.take() {
                old.flush().await?;
            }
            shift_generations(&self.path, self.keep).await;
        }

        let file = self.file().await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.size += len;
        Ok(())
    }
}

/// Starts the mirror task; lines sent on the returned channel are appended to disk.
pub fn spawn_console_mirror(settings: &ConsoleLogSettings) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut console = ConsoleFile::new(settings);

    tokio::spawn(async move {
        let mut failing = false;
        while let Some(line) = rx.recv().await {
            match console.append(&line).await {
                Ok(()) => failing = false,
                // Warn once per failure streak, not per line.
                Err(e) if !failing => {
                    failing = true;
                    tracing::warn!(path = %console.path.display(), error = %e, "console log write failed");
                }
                Err(_) => {}
            }
        }
    });

    tx
}
