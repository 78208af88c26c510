//! Replica read sessions over the current dump file.
//!
//! A session is created on the first `get_next_data` call for an unknown
//! UUID: the whole of `current.dump` is buffered and tagged with the dump
//! version it came from. Each subsequent call decodes exactly one element
//! batch. A new dump invalidates every open session; replicas restart their
//! dump sync when they see `DumpReadSessionClosed`.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};

use tracing::debug;

use fq_core::codec;
use fq_core::error::{Error, Result};
use fq_core::types::DumpElem;

use super::{Dumper, MAX_SESSIONS};

/// Sessions idle longer than this are dropped by the cleaner.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Cleaner tick period.
pub(super) const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(super) struct ReadSession {
    cursor: Cursor<Vec<u8>>,
    closed: bool,
    dump_version: u64,
    last_access: Instant,
}

pub(super) struct SessionTable {
    map: HashMap<String, ReadSession>,
    active: usize,
}

impl SessionTable {
    pub(super) fn new() -> Self {
        Self {
            map: HashMap::new(),
            active: 0,
        }
    }

    fn close(&mut self, session_uuid: &str) {
        if let Some(session) = self.map.get_mut(session_uuid) {
            if !session.closed {
                session.closed = true;
                session.cursor = Cursor::new(Vec::new());
                self.active = self.active.saturating_sub(1);
            }
        }
    }
}

impl Dumper {
    /// Next element batch for the session; `(batch, true)` while data
    /// remains, `(empty, false)` once the buffer is exhausted.
    pub async fn get_next_data(&self, session_uuid: &str) -> Result<(Vec<DumpElem>, bool)> {
        {
            let table = self.sessions.lock();
            if !table.map.contains_key(session_uuid) && table.active >= MAX_SESSIONS {
                return Err(Error::DumpSessionLimit { max: MAX_SESSIONS });
            }
        }

        self.ensure_session(session_uuid).await?;

        let current_version = self.dump_version();
        let mut table = self.sessions.lock();

        let (closed, version_matches) = match table.map.get(session_uuid) {
            Some(session) => (session.closed, session.dump_version == current_version),
            None => return Err(Error::DumpReadSessionClosed),
        };

        if closed {
            return Err(Error::DumpReadSessionClosed);
        }

        // A newer dump replaced the file this session buffered.
        if !version_matches {
            table.close(session_uuid);
            return Err(Error::DumpReadSessionClosed);
        }

        let decoded = {
            let session = table
                .map
                .get_mut(session_uuid)
                .ok_or(Error::DumpReadSessionClosed)?;
            session.last_access = Instant::now();

            if session.cursor.position() >= session.cursor.get_ref().len() as u64 {
                None
            } else {
                Some(codec::decode_from::<_, Vec<DumpElem>>(&mut session.cursor))
            }
        };

        match decoded {
            None => {
                table.close(session_uuid);
                Ok((Vec::new(), false))
            }
            Some(Ok(batch)) => Ok((batch, true)),
            Some(Err(e)) => {
                table.close(session_uuid);
                Err(e)
            }
        }
    }

    pub fn close_read_session(&self, session_uuid: &str) {
        self.sessions.lock().close(session_uuid);
    }

    pub(super) fn invalidate_all_sessions(&self) {
        let mut table = self.sessions.lock();
        let mut invalidated = 0usize;

        for session in table.map.values_mut() {
            if !session.closed {
                session.closed = true;
                session.cursor = Cursor::new(Vec::new());
                invalidated += 1;
            }
        }
        table.active = table.active.saturating_sub(invalidated);

        if invalidated > 0 {
            debug!(invalidated, "dump read sessions invalidated");
        }
    }

    pub(super) fn cleanup_expired_sessions(&self) {
        let now = Instant::now();
        let mut table = self.sessions.lock();

        let expired: Vec<String> = table
            .map
            .iter()
            .filter(|(_, s)| s.closed || now.duration_since(s.last_access) > SESSION_TTL)
            .map(|(uuid, _)| uuid.clone())
            .collect();

        for uuid in expired {
            table.close(&uuid);
            table.map.remove(&uuid);
        }
    }

    async fn ensure_session(&self, session_uuid: &str) -> Result<()> {
        if self.sessions.lock().map.contains_key(session_uuid) {
            return Ok(());
        }

        // Buffer the file outside the session lock; a concurrent dump cycle
        // is excluded by the shared side of the dump file lock.
        let _guard = self.dump_file_lock.read().await;
        let version = self.dump_version();

        let data = match std::fs::read(self.current_dump_path()) {
            Ok(data) => data,
            // No dump yet is normal for a first boot; the session drains
            // immediately.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::Dump {
                    message: format!("open dump file: {e}"),
                })
            }
        };

        let mut table = self.sessions.lock();
        if !table.map.contains_key(session_uuid) {
            table.map.insert(
                session_uuid.to_string(),
                ReadSession {
                    cursor: Cursor::new(data),
                    closed: false,
                    dump_version: version,
                    last_access: Instant::now(),
                },
            );
            table.active += 1;
        }

        Ok(())
    }
}
