use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const TAIL_CHUNK: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_size_bytes: u64,
    pub max_files: u32,
}

/// Where a slot's stdout/stderr go when it does not name a log file.
pub fn slot_log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{name}.log"))
}

/// Opens `path` for appending, creating it (and its directory) as needed.
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o640)
        .open(path)
}

/// Shifts `app.log` to `app.log.1` (and older files up the chain) once it
/// reaches the size limit. Returns whether a rotation happened.
pub fn rotate_if_needed(path: &Path, policy: LogRotationPolicy) -> Result<bool> {
    if policy.max_size_bytes == 0 || policy.max_files == 0 {
        return Ok(false);
    }
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()))
        }
    };
    if size < policy.max_size_bytes {
        return Ok(false);
    }

    let _ = fs::remove_file(rotated_path(path, policy.max_files));
    for index in (1..policy.max_files).rev() {
        let from = rotated_path(path, index);
        if from.exists() {
            let to = rotated_path(path, index + 1);
            fs::rename(&from, &to).with_context(|| {
                format!("failed to rotate {} -> {}", from.display(), to.display())
            })?;
        }
    }
    let first = rotated_path(path, 1);
    fs::rename(path, &first)
        .with_context(|| format!("failed to rotate {} -> {}", path.display(), first.display()))?;
    Ok(true)
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

/// Last `max_lines` lines of a text file, reading backwards in chunks so large
/// logs are never loaded whole.
pub fn read_last_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed opening {}", path.display()))
        }
    };
    let mut end = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let mut tail: Vec<u8> = Vec::new();
    while end > 0 && tail.iter().filter(|byte| **byte == b'\n').count() <= max_lines {
        let start = end.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0_u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .with_context(|| format!("failed seeking {}", path.display()))?;
        file.read_exact(&mut chunk)
            .with_context(|| format!("failed reading {}", path.display()))?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
        end = start;
    }

    let text = String::from_utf8_lossy(&tail);
    let mut window: VecDeque<&str> = VecDeque::with_capacity(max_lines + 1);
    for line in text.lines() {
        if window.len() == max_lines {
            window.pop_front();
        }
        window.push_back(line);
    }
    Ok(window.into_iter().map(str::to_string).collect())
}

/// A bounded window over the end of a log file, ready for printing.
pub struct LogTail {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl LogTail {
    pub fn read(path: &Path, max_lines: usize) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            lines: read_last_lines(path, max_lines)?,
        })
    }
}

impl fmt::Display for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==> {} <==", self.path.display())?;
        if self.lines.is_empty() {
            return writeln!(f, "(empty)");
        }
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
