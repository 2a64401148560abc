use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{sleep, Duration};

use crate::config::AppConfig;
use crate::errors::WardenError;
use crate::logging::LogTail;

use super::common::{known_slots, log_path_for};

pub(crate) async fn run(config: &AppConfig, slot: &str, lines: usize, follow: bool) -> Result<()> {
    if !known_slots(config)?.contains(slot) {
        return Err(WardenError::UnknownSlot(slot.to_string()).into());
    }
    let path = log_path_for(config, slot)?;

    print_last_logs(&path, lines)?;
    if follow {
        println!("Following {} (Ctrl-C to stop)...", path.display());
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            result = follow_file(path) => result?,
        }
    }

    Ok(())
}

fn print_last_logs(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("==> {} <==", path.display());
        println!("(no output yet)");
        return Ok(());
    }
    print!("{}", LogTail::read(path, lines)?);
    Ok(())
}

/// Streams appended bytes. Truncation or rotation reopens the file from the start.
async fn follow_file(path: PathBuf) -> Result<()> {
    let mut file = loop {
        match tokio::fs::File::open(&path).await {
            Ok(mut file) => {
                file.seek(std::io::SeekFrom::End(0)).await?;
                break file;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                sleep(Duration::from_millis(300)).await;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open {}", path.display()))
            }
        }
    };

    loop {
        let mut buffer = Vec::new();
        let bytes_read = file.read_to_end(&mut buffer).await?;
        if bytes_read > 0 {
            let text = String::from_utf8_lossy(&buffer);
            for line in text.lines() {
                println!("{line}");
            }
        } else {
            let current_pos = file.stream_position().await?;
            let shrunk = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.len() < current_pos)
                .unwrap_or(false);
            if shrunk {
                file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("failed to reopen {}", path.display()))?;
            }
        }
        sleep(Duration::from_millis(300)).await;
    }
}
