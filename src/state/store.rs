//! Session storage.
//!
//! Holds at most one session per channel. Every entry expires a fixed time
//! after it was last written; expired entries behave exactly like missing
//! ones. The TTL matches how long the platform keeps an interaction usable.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StoreError;
use super::session::GameSession;
use super::ChannelId;

/// Default time-to-live for stored sessions (15 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Keyed storage for game sessions.
///
/// Implementations must be safe to call from several tasks at once. Callers
/// serialize access per channel; the store itself only has to keep distinct
/// channels independent.
pub trait SessionStore: Send + Sync {
    /// Fetch a live session. Unknown and expired channels are `NotFound`.
    fn get(&self, channel_id: ChannelId) -> Result<GameSession, StoreError>;

    /// Insert or overwrite, restarting the TTL.
    fn put(&self, session: &GameSession) -> Result<(), StoreError>;

    /// Remove a session. Removing a missing session is not an error.
    fn delete(&self, channel_id: ChannelId) -> Result<(), StoreError>;

    /// Check if a live session exists.
    fn exists(&self, channel_id: ChannelId) -> Result<bool, StoreError> {
        match self.get(channel_id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Channels with a live session, in no particular order.
    fn channels(&self) -> Result<Vec<ChannelId>, StoreError>;

    /// Drop expired entries, returning their channels.
    fn purge_expired(&self) -> Result<Vec<ChannelId>, StoreError>;
}

/// A stored session with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: GameSession,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    fn new(session: GameSession, ttl: Duration) -> Self {
        let ttl = chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            session,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// In-process store.
#[derive(Debug)]
pub struct MemoryStore {
    ttl: Duration,
    records: RwLock<HashMap<ChannelId, SessionRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, channel_id: ChannelId) -> Result<GameSession, StoreError> {
        {
            let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
            match records.get(&channel_id) {
                Some(record) if !record.is_expired() => return Ok(record.session.clone()),
                Some(_) => {}
                None => return Err(StoreError::NotFound(channel_id)),
            }
        }

        // Expired: drop it on the way out
        self.delete(channel_id)?;
        Err(StoreError::NotFound(channel_id))
    }

    fn put(&self, session: &GameSession) -> Result<(), StoreError> {
        let record = SessionRecord::new(session.clone(), self.ttl);
        self.records
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(session.channel_id, record);
        Ok(())
    }

    fn delete(&self, channel_id: ChannelId) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(&channel_id);
        Ok(())
    }

    fn channels(&self) -> Result<Vec<ChannelId>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .iter()
            .filter(|(_, r)| !r.is_expired())
            .map(|(id, _)| *id)
            .collect())
    }

    fn purge_expired(&self) -> Result<Vec<ChannelId>, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let expired: Vec<ChannelId> = records
            .iter()
            .filter(|(_, r)| r.is_expired())
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            records.remove(id);
        }

        Ok(expired)
    }
}

/// Store keeping one JSON file per channel, so sessions survive a restart.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    ttl: Duration,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, channel_id: ChannelId) -> PathBuf {
        self.dir.join(format!("{}.json", channel_id))
    }

    fn read_record(&self, channel_id: ChannelId) -> Result<Option<SessionRecord>, StoreError> {
        let raw = match fs::read(self.path_for(channel_id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                channel: channel_id,
                source,
            })
    }

    fn record_ids(&self) -> Result<Vec<ChannelId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(ChannelId(id));
            }
        }
        Ok(ids)
    }
}

impl SessionStore for JsonFileStore {
    fn get(&self, channel_id: ChannelId) -> Result<GameSession, StoreError> {
        match self.read_record(channel_id)? {
            Some(record) if !record.is_expired() => Ok(record.session),
            Some(_) => {
                self.delete(channel_id)?;
                Err(StoreError::NotFound(channel_id))
            }
            None => Err(StoreError::NotFound(channel_id)),
        }
    }

    fn put(&self, session: &GameSession) -> Result<(), StoreError> {
        let record = SessionRecord::new(session.clone(), self.ttl);
        let json = serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Codec {
            channel: session.channel_id,
            source,
        })?;

        // Write then rename so readers never see a half-written record
        let path = self.path_for(session.channel_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, channel_id: ChannelId) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(channel_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn channels(&self) -> Result<Vec<ChannelId>, StoreError> {
        let mut live = Vec::new();
        for channel_id in self.record_ids()? {
            match self.read_record(channel_id) {
                Ok(Some(record)) if !record.is_expired() => live.push(channel_id),
                Ok(_) | Err(StoreError::Codec { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }

    fn purge_expired(&self) -> Result<Vec<ChannelId>, StoreError> {
        let mut expired = Vec::new();
        for channel_id in self.record_ids()? {
            let is_expired = match self.read_record(channel_id) {
                Ok(Some(record)) => record.is_expired(),
                Ok(None) => false,
                // Unreadable records can never be served again
                Err(StoreError::Codec { .. }) => true,
                Err(e) => return Err(e),
            };
            if is_expired {
                self.delete(channel_id)?;
                expired.push(channel_id);
            }
        }
        Ok(expired)
    }
}
