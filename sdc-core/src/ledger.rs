//! C2 — Chain-hashed, append-only ledger. One generic implementation,
//! instantiated three times (perimeter, access, conversation) over
//! different payload types.
//!
//! The chain hash is computed over a pinned, stable subset of fields
//! (sequence, entryId, event type, timestamp, previousHash) plus a
//! canonical hash of the payload itself — reconciling 's "chainHash =
//! H(payload ‖ prevHash)" with 's explicit fixed-field list: the
//! payload enters the chain only through its own hash, so the pinned
//! subset stays a fixed, reproducible string while still binding the
//! payload's content (see DESIGN.md).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use crypto_primitives::sha256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storage::JsonFileStore;

use crate::canonical::canonical_generic_hash_hex;
use crate::error::{SdcError, SdcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Alert,
    Critical,
}

pub trait LedgerPayload: Serialize + DeserializeOwned + Clone {
    fn event_type(&self) -> &str;
    fn severity(&self) -> Severity {
        Severity::Info
    }
    fn actor(&self) -> Option<&str> {
        None
    }
    fn source_id(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry<P> {
    pub entry_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub payload: P,
    pub chain_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerFile<P> {
    pub engine: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<LedgerEntry<P>>,
}

impl<P> Default for LedgerFile<P> {
    fn default() -> Self {
        Self {
            engine: String::new(),
            version: "1.0.0".to_string(),
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub intact: bool,
    pub entry_count: usize,
    pub broken_at: Option<u64>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    pub source_id: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub struct ChainLedger<P: LedgerPayload> {
    store: JsonFileStore<LedgerFile<P>>,
    file: LedgerFile<P>,
    genesis: String,
    actor_index: HashMap<String, Vec<usize>>,
    source_index: HashMap<String, Vec<usize>>,
}

fn genesis_for(engine: &str) -> String {
    crypto_primitives::sha256_hex(format!("sdc-ledger-genesis:{engine}").as_bytes())
}

impl<P: LedgerPayload> ChainLedger<P> {
    pub fn open(engine: &str, path: impl Into<std::path::PathBuf>) -> Self {
        let store: JsonFileStore<LedgerFile<P>> = JsonFileStore::new(path);
        let mut file = store.load();
        if file.engine.is_empty() {
            file.engine = engine.to_string();
        }
        let genesis = genesis_for(engine);
        let mut ledger = Self {
            store,
            file,
            genesis,
            actor_index: HashMap::new(),
            source_index: HashMap::new(),
        };
        ledger.rebuild_indices();
        ledger
    }

    fn rebuild_indices(&mut self) {
        self.actor_index.clear();
        self.source_index.clear();
        for (i, entry) in self.file.entries.iter().enumerate() {
            if let Some(actor) = entry.payload.actor() {
                self.actor_index.entry(actor.to_string()).or_default().push(i);
            }
            if let Some(source) = entry.payload.source_id() {
                self.source_index.entry(source.to_string()).or_default().push(i);
            }
        }
    }

    fn chain_hash_input(
        sequence: u64,
        entry_id: &str,
        event_type: &str,
        timestamp: &DateTime<Utc>,
        payload_hash: &str,
        previous_hash: &str,
    ) -> String {
        format!(
            "{sequence}|{entry_id}|{event_type}|{}|{payload_hash}|{previous_hash}",
            timestamp.to_rfc3339()
        )
    }

    fn previous_hash(&self) -> String {
        self.file
            .entries
            .last()
            .map(|e| e.chain_hash.clone())
            .unwrap_or_else(|| self.genesis.clone())
    }

    /// Append-only; total in the absence of I/O failure. On persistence
    /// failure the in-memory state is rolled back.
    pub fn append(&mut self, payload: P) -> SdcResult<LedgerEntry<P>> {
        let sequence = self.file.entries.len() as u64 + 1;
        let entry_id = crypto_primitives::SecureRandom::hex(16);
        let timestamp = Utc::now();
        let event_type = payload.event_type().to_string();
        let severity = payload.severity();
        let payload_hash = canonical_generic_hash_hex(&payload);
        let previous_hash = self.previous_hash();

        let chain_hash = crypto_primitives::sha256_hex(
            Self::chain_hash_input(sequence, &entry_id, &event_type, &timestamp, &payload_hash, &previous_hash)
                .as_bytes(),
        );

        let entry = LedgerEntry {
            entry_id,
            sequence,
            timestamp,
            event_type,
            severity,
            payload,
            chain_hash,
        };

        self.file.entries.push(entry.clone());
        if let Err(e) = self.store.save(&self.file) {
            self.file.entries.pop();
            return Err(SdcError::Storage(e));
        }
        let idx = self.file.entries.len() - 1;
        if let Some(actor) = entry.payload.actor() {
            self.actor_index.entry(actor.to_string()).or_default().push(idx);
        }
        if let Some(source) = entry.payload.source_id() {
            self.source_index.entry(source.to_string()).or_default().push(idx);
        }
        Ok(entry)
    }

    /// Pure; safe to call concurrently with appends on a snapshot.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let mut previous_hash = self.genesis.clone();
        for entry in &self.file.entries {
            let payload_hash = canonical_generic_hash_hex(&entry.payload);
            let expected = crypto_primitives::sha256_hex(
                Self::chain_hash_input(
                    entry.sequence,
                    &entry.entry_id,
                    &entry.event_type,
                    &entry.timestamp,
                    &payload_hash,
                    &previous_hash,
                )
                .as_bytes(),
            );
            if expected != entry.chain_hash {
                return IntegrityReport {
                    intact: false,
                    entry_count: self.file.entries.len(),
                    broken_at: Some(entry.sequence),
                    expected: Some(expected),
                    actual: Some(entry.chain_hash.clone()),
                };
            }
            previous_hash = entry.chain_hash.clone();
        }
        IntegrityReport {
            intact: true,
            entry_count: self.file.entries.len(),
            broken_at: None,
            expected: None,
            actual: None,
        }
    }

    pub fn len(&self) -> usize {
        self.file.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.entries.is_empty()
    }

    pub fn entries(&self) -> &[LedgerEntry<P>] {
        &self.file.entries
    }

    /// Filtered query. Hot filters (actor, source id) consult a secondary
    /// index rather than scanning every entry.
    pub fn query(&self, q: &LedgerQuery) -> Vec<&LedgerEntry<P>> {
        let candidate_indices: Vec<usize> = match (&q.actor, &q.source_id) {
            (Some(actor), _) => self.actor_index.get(actor).cloned().unwrap_or_default(),
            (None, Some(source)) => self.source_index.get(source).cloned().unwrap_or_default(),
            (None, None) => (0..self.file.entries.len()).collect(),
        };

        let mut matched: Vec<&LedgerEntry<P>> = candidate_indices
            .into_iter()
            .filter_map(|i| self.file.entries.get(i))
            .filter(|e| match &q.event_type {
                Some(t) => &e.event_type == t,
                None => true,
            })
            .filter(|e| match q.severity {
                Some(s) => e.severity == s,
                None => true,
            })
            .filter(|e| match &q.source_id {
                Some(s) => e.payload.source_id() == Some(s.as_str()),
                None => true,
            })
            .filter(|e| match &q.actor {
                Some(a) => e.payload.actor() == Some(a.as_str()),
                None => true,
            })
            .filter(|e| match q.since {
                Some(since) => e.timestamp >= since,
                None => true,
            })
            .filter(|e| match q.until {
                Some(until) => e.timestamp <= until,
                None => true,
            })
            .collect();

        matched.sort_by_key(|e| e.sequence);
        if let Some(limit) = q.limit {
            let len = matched.len();
            if len > limit {
                matched = matched.split_off(len - limit);
            }
        }
        matched
    }
}
