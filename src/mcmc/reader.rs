use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Extension of the files the sampler writes draws into.
pub const DATA_FILE_EXTENSION: &str = "csv";
/// Hidden checkpoint file kept inside the data directory.
pub const HANDLED_FILE_NAME: &str = ".mcmc_data_handled";

/// How far a data file has been consumed. Persisted as `[size, lines]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, usize)", into = "(u64, usize)")]
pub struct FileCheckpoint {
    pub size: u64,
    pub lines_consumed: usize,
}

impl From<(u64, usize)> for FileCheckpoint {
    fn from((size, lines_consumed): (u64, usize)) -> Self {
        Self {
            size,
            lines_consumed,
        }
    }
}

impl From<FileCheckpoint> for (u64, usize) {
    fn from(checkpoint: FileCheckpoint) -> Self {
        (checkpoint.size, checkpoint.lines_consumed)
    }
}

/// Lines appended to a data file since its previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLines {
    /// 1-based line number of `lines[0]` within the file.
    pub first_line: usize,
    pub lines: Vec<String>,
    pub checkpoint: FileCheckpoint,
}

/// Resumability checkpoint: file name -> consumed size and line count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandledIndex {
    files: BTreeMap<String, FileCheckpoint>,
}

impl HandledIndex {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(HANDLED_FILE_NAME)
    }

    /// Load the index from `path`; a missing file is an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self).context("failed to serialize handled-file index")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| {
            format!(
                "failed to move temporary file {} to {}",
                tmp.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    pub fn get(&self, file_name: &str) -> FileCheckpoint {
        self.files.get(file_name).copied().unwrap_or_default()
    }

    pub fn record(&mut self, file_name: &str, checkpoint: FileCheckpoint) {
        self.files.insert(file_name.to_string(), checkpoint);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Data files in `dir`, sorted by name. Anything without the data file
/// extension is ignored.
pub fn list_data_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let is_data_file = path
            .extension()
            .is_some_and(|ext| ext == DATA_FILE_EXTENSION);
        if is_data_file && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

pub fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))
}

/// Return the lines appended to `path` since `checkpoint`, or `None` when
/// there is nothing new to consume (a file that shrank counts as unchanged).
///
/// Only newline-terminated lines are consumed unless `accept_partial_tail`
/// is set. A held-back last line keeps the recorded size at the end of the
/// last complete line, so a later read sees it again.
pub fn read_new_lines(
    path: &Path,
    checkpoint: FileCheckpoint,
    accept_partial_tail: bool,
) -> Result<Option<NewLines>> {
    let size = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if size <= checkpoint.size {
        return Ok(None);
    }

    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    let mut lines = Vec::new();
    let mut consumed_bytes = 0usize;
    let mut held_back = false;
    for (index, raw) in content.split_inclusive('\n').enumerate() {
        if index < checkpoint.lines_consumed {
            consumed_bytes += raw.len();
            continue;
        }
        if !raw.ends_with('\n') && !accept_partial_tail {
            held_back = true;
            break;
        }
        consumed_bytes += raw.len();
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        lines.push(line.to_string());
    }
    if lines.is_empty() {
        return Ok(None);
    }

    let new_size = if held_back {
        consumed_bytes as u64
    } else {
        (content.len() as u64).max(size)
    };
    Ok(Some(NewLines {
        first_line: checkpoint.lines_consumed + 1,
        checkpoint: FileCheckpoint {
            size: new_size,
            lines_consumed: checkpoint.lines_consumed + lines.len(),
        },
        lines,
    }))
}
