//! Persistent storage using sled

use crate::fork::Fork;
use crate::integrity::DetectionAlert;
use relay_core::types::*;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;

const NEXT_ROUND_KEY: &str = "next_round";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Corrupt metadata value: {0}")]
    CorruptMetadata(String),
}

/// An admitted event with its local receive time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    pub received_at: u64,
}

/// Storage backend for relayd
pub struct Storage {
    db: Db,
    /// event_id -> StoredEvent
    events: sled::Tree,
    /// fork_id -> Fork
    forks: sled::Tree,
    /// alert_id -> DetectionAlert
    alerts: sled::Tree,
    /// key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory storage discarded on drop
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let events = db.open_tree("events")?;
        let forks = db.open_tree("forks")?;
        let alerts = db.open_tree("alerts")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            events,
            forks,
            alerts,
            metadata,
        })
    }

    // ===== EVENTS =====

    /// Store or overwrite an event
    pub fn put_event(&self, event: &Event, received_at: u64) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(&StoredEvent {
            event: event.clone(),
            received_at,
        })?;
        self.events.insert(event.id.0, value)?;
        Ok(())
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<StoredEvent>, StorageError> {
        match self.events.get(id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_event(&self, id: &EventId) -> Result<(), StorageError> {
        self.events.remove(id.0)?;
        Ok(())
    }

    /// All stored events, parents before children
    pub fn load_events(&self) -> Result<Vec<StoredEvent>, StorageError> {
        let mut events = Vec::with_capacity(self.events.len());
        for result in self.events.iter() {
            let (_, bytes) = result?;
            events.push(postcard::from_bytes::<StoredEvent>(&bytes)?);
        }
        events.sort_by(|a, b| {
            a.event
                .height
                .cmp(&b.event.height)
                .then_with(|| a.received_at.cmp(&b.received_at))
        });
        Ok(events)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    // ===== FORKS =====

    pub fn put_fork(&self, fork: &Fork) -> Result<(), StorageError> {
        self.forks.insert(fork.id.0, postcard::to_allocvec(fork)?)?;
        Ok(())
    }

    pub fn delete_fork(&self, id: &ForkId) -> Result<(), StorageError> {
        self.forks.remove(id.0)?;
        Ok(())
    }

    pub fn load_forks(&self) -> Result<Vec<Fork>, StorageError> {
        let mut forks = Vec::new();
        for result in self.forks.iter() {
            let (_, bytes) = result?;
            forks.push(postcard::from_bytes(&bytes)?);
        }
        Ok(forks)
    }

    // ===== ALERTS =====

    pub fn put_alert(&self, alert: &DetectionAlert) -> Result<(), StorageError> {
        self.alerts.insert(alert.id.0, postcard::to_allocvec(alert)?)?;
        Ok(())
    }

    pub fn delete_alert(&self, id: &AlertId) -> Result<(), StorageError> {
        self.alerts.remove(id.0)?;
        Ok(())
    }

    pub fn load_alerts(&self) -> Result<Vec<DetectionAlert>, StorageError> {
        let mut alerts = Vec::new();
        for result in self.alerts.iter() {
            let (_, bytes) = result?;
            alerts.push(postcard::from_bytes(&bytes)?);
        }
        Ok(alerts)
    }

    // ===== METADATA =====

    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Persist the next consensus round number
    pub fn put_next_round(&self, round: u64) -> Result<(), StorageError> {
        self.put_metadata(NEXT_ROUND_KEY, &round.to_le_bytes())
    }

    pub fn get_next_round(&self) -> Result<Option<u64>, StorageError> {
        match self.get_metadata(NEXT_ROUND_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::CorruptMetadata(NEXT_ROUND_KEY.into()))?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
