//! Segment file I/O.
//!
//! A segment named `wal_<unixMillis>.log` is a concatenation of
//! `{u32 big-endian length}{encoded record batch}` frames. Segment names
//! sort chronologically, which the recovery reader and the replication
//! master both rely on.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{error, warn};

use fq_core::codec;
use fq_core::error::{Error, Result};
use fq_core::utils::now_unix_millis;

use super::types::{LogData, PendingLog};

pub const SEGMENT_PREFIX: &str = "wal_";
pub const SEGMENT_SUFFIX: &str = ".log";

/// Upper bound on one encoded batch; anything larger is corruption.
pub const MAX_BATCH_ENCODED_SIZE: usize = 100 << 20;

pub fn segment_file_name(unix_millis: u64) -> String {
    format!("{SEGMENT_PREFIX}{unix_millis}{SEGMENT_SUFFIX}")
}

fn is_segment_name(name: &str) -> bool {
    name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX)
}

/// Sorted names of all segments in `directory`; empty when it doesn't exist.
pub fn list_segments(directory: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_segment_name(name) {
                names.push(name.to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}

/// First segment name strictly greater than `last_name` (any segment when
/// `last_name` is empty).
pub fn segment_upper_bound(directory: &Path, last_name: &str) -> Result<Option<String>> {
    let names = list_segments(directory)?;
    Ok(names.into_iter().find(|name| name.as_str() > last_name))
}

/// Name of the newest segment, if any.
pub fn segment_last(directory: &Path) -> Result<Option<String>> {
    let names = list_segments(directory)?;
    Ok(names.into_iter().next_back())
}

/// Appends record batches to the active segment, rotating by size.
/// Sole owner of the segment file handle.
pub struct FsWriter {
    directory: PathBuf,
    max_segment_size: usize,
    segment: Option<File>,
    segment_size: usize,
}

impl FsWriter {
    pub fn new(directory: impl Into<PathBuf>, max_segment_size: usize) -> Self {
        Self {
            directory: directory.into(),
            max_segment_size,
            segment: None,
            segment_size: 0,
        }
    }

    /// Persist one batch and resolve every record's write future with the
    /// outcome. The batch is encoded as a single frame and fsynced before
    /// acknowledgement.
    pub fn write_batch(&mut self, batch: Vec<PendingLog>) {
        if batch.is_empty() {
            return;
        }

        if self.segment.is_none() || self.segment_size > self.max_segment_size {
            if let Err(e) = self.rotate_segment() {
                error!(error = %e, "failed to rotate WAL segment");
                acknowledge(batch, &e.to_string());
                return;
            }
        }

        let logs: Vec<&LogData> = batch.iter().map(|log| &log.data).collect();
        if let Err(e) = self.write_logs(&logs) {
            warn!(error = %e, "failed to write WAL batch");
            acknowledge(batch, &e.to_string());
            return;
        }

        let segment = self.segment.as_ref().expect("segment is open");
        if let Err(e) = segment.sync_all() {
            error!(error = %e, "failed to sync WAL segment");
            acknowledge(batch, &e.to_string());
            return;
        }

        for log in batch {
            log.resolve(Ok(()));
        }
    }

    fn write_logs(&mut self, logs: &[&LogData]) -> Result<()> {
        let payload = codec::encode(&logs)?;

        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.write_u32::<BigEndian>(payload.len() as u32)?;
        frame.extend_from_slice(&payload);

        let segment = self.segment.as_mut().expect("segment is open");
        segment.write_all(&frame)?;
        self.segment_size += frame.len();

        Ok(())
    }

    fn rotate_segment(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.directory)?;

        let path = self.directory.join(segment_file_name(now_unix_millis()));
        let segment = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        self.segment = Some(segment);
        self.segment_size = 0;

        Ok(())
    }
}

fn acknowledge(batch: Vec<PendingLog>, message: &str) {
    for log in batch {
        log.resolve(Err(Error::WriteAheadLog {
            message: message.to_string(),
            source: None,
        }));
    }
}

/// Reads segments back into record batches.
#[derive(Debug, Clone)]
pub struct FsReader {
    directory: PathBuf,
}

impl FsReader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// All records across all segments, sorted by LSN.
    pub fn read_logs(&self) -> Result<Vec<LogData>> {
        let mut logs = Vec::new();
        for name in list_segments(&self.directory)? {
            let segment = self.read_segment(&self.directory.join(name))?;
            logs.extend(segment);
        }

        logs.sort_by_key(|log| log.lsn);
        Ok(logs)
    }

    pub fn read_segment(&self, path: &Path) -> Result<Vec<LogData>> {
        let data = std::fs::read(path)?;
        self.read_segment_data(&data)
    }

    /// Decode a raw segment body. Any malformed frame is a hard error; the
    /// WAL never guesses around corruption.
    pub fn read_segment_data(&self, data: &[u8]) -> Result<Vec<LogData>> {
        let mut logs = Vec::new();
        let mut cursor = Cursor::new(data);

        while (cursor.position() as usize) < data.len() {
            let batch_size = cursor.read_u32::<BigEndian>().map_err(|e| {
                Error::WriteAheadLog {
                    message: "truncated batch length".to_string(),
                    source: Some(Box::new(e)),
                }
            })? as usize;

            if batch_size > MAX_BATCH_ENCODED_SIZE {
                return Err(Error::WriteAheadLog {
                    message: format!("batch size {batch_size} exceeds maximum"),
                    source: None,
                });
            }

            let mut payload = vec![0u8; batch_size];
            cursor.read_exact(&mut payload).map_err(|e| Error::WriteAheadLog {
                message: "truncated batch payload".to_string(),
                source: Some(Box::new(e)),
            })?;

            let batch: Vec<LogData> = codec::decode(&payload)?;
            logs.extend(batch);
        }

        Ok(logs)
    }
}
