//! RocksDB-backed state store
//!
//! Column families keep strikes, results and escalation tasks apart while
//! sharing one RocksDB instance. Values are bincode-encoded.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::schema::{self, ALL_CFS};
use super::{StateStore, StoreError, StoreResult};
use crate::escalation::{EscalationId, EscalationTask};
use crate::metrics::ResultRecord;
use crate::strikes::{StrikeCategory, StrikeRecord};

fn nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(0)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// RocksDB-backed persistent state store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create a state store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        debug!(path = %path.display(), "Opened RocksDB state store");

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let bytes = encode(value)?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Values from `start_key` forward while `keep(key)` holds.
    fn scan_from<T, F>(&self, cf_name: &str, start_key: &str, mut keep: F) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&str) -> bool,
    {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let iter = db.iterator_cf(
            &cf,
            IteratorMode::From(start_key.as_bytes(), Direction::Forward),
        );

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            let key_str = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            if !keep(&key_str) {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }
}

impl StateStore for RocksStore {
    fn append_strike(&self, record: &StrikeRecord) -> StoreResult<()> {
        let key = schema::keys::strike(
            &record.subject_id,
            record.category,
            nanos(record.timestamp),
            &record.id,
        );
        self.put(schema::CF_STRIKES, &key, record)
    }

    fn strikes_since(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<StrikeRecord>> {
        let prefix = schema::keys::strike_prefix(subject_id, category);
        let start = schema::keys::strike(subject_id, category, nanos(since), "");
        let records: Vec<StrikeRecord> =
            self.scan_from(schema::CF_STRIKES, &start, |key| key.starts_with(&prefix))?;
        // Subject ids containing ':' can share a prefix with another subject.
        Ok(records
            .into_iter()
            .filter(|r| r.subject_id == subject_id && r.timestamp >= since)
            .collect())
    }

    fn append_result(&self, record: &ResultRecord) -> StoreResult<()> {
        let key = schema::keys::result(nanos(record.completed_at), &record.event_id);
        self.put(schema::CF_RESULTS, &key, record)
    }

    fn results_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ResultRecord>> {
        let start_key = schema::keys::result(nanos(start), "");
        let end_nanos = nanos(end);
        self.scan_from(schema::CF_RESULTS, &start_key, |key| {
            schema::keys::parse_result_timestamp(key)
                .map(|ts| ts <= end_nanos)
                .unwrap_or(false)
        })
    }

    fn put_escalation(&self, task: &EscalationTask) -> StoreResult<()> {
        let key = schema::keys::escalation(&task.id);
        self.put(schema::CF_ESCALATIONS, &key, task)
    }

    fn get_escalation(&self, id: &EscalationId) -> StoreResult<Option<EscalationTask>> {
        let key = schema::keys::escalation(id);
        self.get(schema::CF_ESCALATIONS, &key)
    }

    fn pending_escalations(&self) -> StoreResult<Vec<EscalationTask>> {
        let tasks: Vec<EscalationTask> =
            self.scan_from(schema::CF_ESCALATIONS, "esc:", |key| key.starts_with("esc:"))?;
        let mut pending: Vec<EscalationTask> =
            tasks.into_iter().filter(|t| !t.is_terminal()).collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}
