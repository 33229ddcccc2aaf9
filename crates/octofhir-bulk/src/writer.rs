//! NDJSON file writer for bulk export
//!
//! One file per key (resource type, or subject id when output is organized by
//! subject) under `<base>/<job_id>/`. Files are created on the first record,
//! so a key with no records leaves no file behind. Records are joined with
//! `\r\n`; there is no separator before the first or after the last record.
//!
//! Writers append into per-unit staging files under `<job_dir>/.parts/` and
//! close each file after every append, so no descriptor outlives a call no
//! matter how many keys a job produces. [`NdjsonWriter::finish`] concatenates
//! the parts of each key, in unit order, into the final file. A unit's parts
//! can be dropped with [`NdjsonWriter::discard`] before that.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

pub const NDJSON_EXTENSION: &str = "ndjson";
pub const RECORD_SEPARATOR: &[u8] = b"\r\n";

const PARTS_DIR: &str = ".parts";

/// Errors that can occur during NDJSON writing
#[derive(Debug, Error)]
pub enum NdjsonWriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid export path: {0}")]
    InvalidPath(String),
}

/// Whether `name` is usable as a single path component inside a job directory.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && name != ".."
}

/// `<key>.ndjson`
pub fn file_name_for(key: &str) -> String {
    format!("{key}.{NDJSON_EXTENSION}")
}

/// A finished output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    /// Resource type or subject id the file holds.
    pub key: String,
    pub path: PathBuf,
    pub count: usize,
}

fn checked(name: &str) -> Result<&str, NdjsonWriterError> {
    if is_safe_file_name(name) {
        Ok(name)
    } else {
        Err(NdjsonWriterError::InvalidPath(name.to_string()))
    }
}

/// NDJSON writer for one export job
pub struct NdjsonWriter {
    job_dir: PathBuf,
    /// unit -> key -> records staged so far
    parts: BTreeMap<String, BTreeMap<String, usize>>,
}

impl NdjsonWriter {
    /// Creates `<base_path>/<job_id>` and a writer over it.
    pub async fn new(base_path: impl AsRef<Path>, job_id: &str) -> Result<Self, NdjsonWriterError> {
        let job_dir = base_path.as_ref().join(checked(job_id)?);
        fs::create_dir_all(&job_dir).await?;
        Ok(Self {
            job_dir,
            parts: BTreeMap::new(),
        })
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    fn parts_dir(&self) -> PathBuf {
        self.job_dir.join(PARTS_DIR)
    }

    fn part_path(&self, unit: &str, key: &str) -> PathBuf {
        self.parts_dir().join(unit).join(file_name_for(key))
    }

    /// Appends `records` to the part of `key` owned by `unit`.
    ///
    /// The part file is opened, written and closed within the call.
    pub async fn append(&mut self, unit: &str, key: &str, records: &[Value]) -> Result<usize, NdjsonWriterError> {
        checked(unit)?;
        checked(key)?;
        if records.is_empty() {
            return Ok(0);
        }

        let staged = self
            .parts
            .get(unit)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0);
        if staged == 0 {
            fs::create_dir_all(self.parts_dir().join(unit)).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.part_path(unit, key))
            .await?;
        let mut writer = BufWriter::new(file);
        for (i, record) in records.iter().enumerate() {
            if staged + i > 0 {
                writer.write_all(RECORD_SEPARATOR).await?;
            }
            writer.write_all(&serde_json::to_vec(record)?).await?;
        }
        writer.flush().await?;

        *self
            .parts
            .entry(unit.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default() += records.len();
        Ok(records.len())
    }

    /// Appends one record to `<key>.ndjson`.
    pub async fn write_resource(&mut self, key: &str, resource: &Value) -> Result<(), NdjsonWriterError> {
        self.append(key, key, std::slice::from_ref(resource)).await?;
        Ok(())
    }

    pub async fn write_resources(&mut self, key: &str, resources: &[Value]) -> Result<usize, NdjsonWriterError> {
        self.append(key, key, resources).await
    }

    /// Records written so far under `key`, across every unit.
    pub fn count(&self, key: &str) -> usize {
        self.parts.values().filter_map(|keys| keys.get(key)).sum()
    }

    /// Drops everything `unit` has written.
    pub async fn discard(&mut self, unit: &str) -> Result<(), NdjsonWriterError> {
        if self.parts.remove(checked(unit)?).is_none() {
            return Ok(());
        }
        match fs::remove_dir_all(self.parts_dir().join(unit)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Assembles every key's parts into `<key>.ndjson` and returns the files
    /// sorted by key.
    pub async fn finish(self) -> Result<Vec<WrittenFile>, NdjsonWriterError> {
        let keys: BTreeSet<&String> = self.parts.values().flat_map(|staged| staged.keys()).collect();

        let mut written = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.job_dir.join(file_name_for(key));
            let mut output = BufWriter::new(File::create(&path).await?);
            let mut count = 0;
            for (unit, staged) in &self.parts {
                let Some(&records) = staged.get(key) else {
                    continue;
                };
                if count > 0 {
                    output.write_all(RECORD_SEPARATOR).await?;
                }
                let mut part = File::open(self.part_path(unit, key)).await?;
                tokio::io::copy(&mut part, &mut output).await?;
                count += records;
            }
            output.flush().await?;
            output.get_mut().sync_all().await?;
            written.push(WrittenFile {
                key: key.clone(),
                path,
                count,
            });
        }

        match fs::remove_dir_all(self.parts_dir()).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        Ok(written)
    }
}
