//! C11 — LedgerAdapterRegistry: abstract multi-chain anchoring. The core
//! never touches a chain SDK directly; it speaks `AnchorPayload` in and
//! `LedgerReceipt` out through the [`LedgerAdapter`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{SdcError, SdcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Xrpl,
    Ethereum,
    Polygon,
    Ipfs,
    Offline,
}

impl ChainKind {
    fn label(self) -> &'static str {
        match self {
            ChainKind::Xrpl => "xrpl",
            ChainKind::Ethereum => "ethereum",
            ChainKind::Polygon => "polygon",
            ChainKind::Ipfs => "ipfs",
            ChainKind::Offline => "offline",
        }
    }
}

/// Fields eligible for the wire-form, alphabetically sorted by key before
/// joining ( "Anchor payload wire-form").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnchorPayload {
    pub sha256: Option<String>,
    pub merkle_root: Option<String>,
    pub document_id: Option<String>,
    pub protocol_version: Option<String>,
    pub canonical_hash: Option<String>,
    pub sku: Option<String>,
    pub signature_hash: Option<String>,
    pub encrypted_cid: Option<String>,
}

impl AnchorPayload {
    /// `key:value|key:value|...` over the alphabetically sorted subset of
    /// present fields.
    pub fn wire_form(&self) -> String {
        let mut fields: Vec<(&str, &str)> = Vec::new();
        if let Some(v) = &self.sha256 {
            fields.push(("sha256", v));
        }
        if let Some(v) = &self.merkle_root {
            fields.push(("merkleRoot", v));
        }
        if let Some(v) = &self.document_id {
            fields.push(("documentId", v));
        }
        if let Some(v) = &self.protocol_version {
            fields.push(("protocolVersion", v));
        }
        if let Some(v) = &self.canonical_hash {
            fields.push(("canonicalHash", v));
        }
        if let Some(v) = &self.sku {
            fields.push(("sku", v));
        }
        if let Some(v) = &self.signature_hash {
            fields.push(("signatureHash", v));
        }
        if let Some(v) = &self.encrypted_cid {
            fields.push(("encryptedCID", v));
        }
        fields.sort_by_key(|(k, _)| *k);
        fields
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn payload_hash(&self) -> String {
        crypto_primitives::sha256_hex(self.wire_form().as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub chain: ChainKind,
    pub receipt_id: String,
    pub payload_hash: String,
    pub anchored_at: DateTime<Utc>,
    pub external_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub chain: ChainKind,
    pub state: HealthState,
    pub detail: Option<String>,
}

/// Default anchor timeout: implementations should bound any real network
/// call (only the IPFS adapter performs one) to this many seconds.
pub const DEFAULT_ANCHOR_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    fn chain(&self) -> ChainKind;
    async fn anchor(&self, payload: &AnchorPayload) -> SdcResult<LedgerReceipt>;
    async fn verify(&self, receipt: &LedgerReceipt, payload: &AnchorPayload) -> SdcResult<bool>;
    async fn status(&self) -> AdapterHealth;
}

/// Deterministic, always-available adapter. No network I/O; the "receipt"
/// is a locally computed fingerprint.
pub struct OfflineAdapter;

#[async_trait]
impl LedgerAdapter for OfflineAdapter {
    fn chain(&self) -> ChainKind {
        ChainKind::Offline
    }

    async fn anchor(&self, payload: &AnchorPayload) -> SdcResult<LedgerReceipt> {
        let payload_hash = payload.payload_hash();
        let receipt_id = crypto_primitives::sha256_hex(format!("offline-receipt:{payload_hash}").as_bytes());
        Ok(LedgerReceipt {
            chain: ChainKind::Offline,
            receipt_id,
            payload_hash,
            anchored_at: Utc::now(),
            external_ref: None,
        })
    }

    async fn verify(&self, receipt: &LedgerReceipt, payload: &AnchorPayload) -> SdcResult<bool> {
        Ok(receipt.payload_hash == payload.payload_hash())
    }

    async fn status(&self) -> AdapterHealth {
        AdapterHealth {
            chain: ChainKind::Offline,
            state: HealthState::Healthy,
            detail: None,
        }
    }
}

/// Stub for adapters that would otherwise perform real chain I/O (xrpl,
/// ethereum, polygon, ipfs). Out of scope for this crate: the core
/// never links a chain SDK. Registering one reports it unavailable rather
/// than pretending to anchor.
pub struct UnimplementedAdapter(pub ChainKind);

#[async_trait]
impl LedgerAdapter for UnimplementedAdapter {
    fn chain(&self) -> ChainKind {
        self.0
    }

    async fn anchor(&self, _payload: &AnchorPayload) -> SdcResult<LedgerReceipt> {
        Err(SdcError::Other(anyhow::anyhow!(
            "adapter '{}' is not linked in this build",
            self.0.label()
        )))
    }

    async fn verify(&self, _receipt: &LedgerReceipt, _payload: &AnchorPayload) -> SdcResult<bool> {
        Err(SdcError::Other(anyhow::anyhow!(
            "adapter '{}' is not linked in this build",
            self.0.label()
        )))
    }

    async fn status(&self) -> AdapterHealth {
        AdapterHealth {
            chain: self.0,
            state: HealthState::Unavailable,
            detail: Some("adapter not linked in this build".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnchorOutcome {
    pub chain: ChainKind,
    pub receipt: Option<LedgerReceipt>,
    pub error: Option<String>,
}

/// Holds a set of adapters, tracks an active chain, and supports
/// multi-chain anchoring with a primary plus redundant set.
pub struct LedgerAdapterRegistry {
    adapters: HashMap<ChainKind, Box<dyn LedgerAdapter>>,
    active: ChainKind,
}

impl LedgerAdapterRegistry {
    /// Offline is always registered; callers add others as the build
    /// supports them (: "offline adapter is always available").
    pub fn new() -> Self {
        let mut adapters: HashMap<ChainKind, Box<dyn LedgerAdapter>> = HashMap::new();
        adapters.insert(ChainKind::Offline, Box::new(OfflineAdapter));
        Self {
            adapters,
            active: ChainKind::Offline,
        }
    }

    pub fn register(&mut self, adapter: Box<dyn LedgerAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    pub fn set_active(&mut self, chain: ChainKind) -> SdcResult<()> {
        if !self.adapters.contains_key(&chain) {
            return Err(SdcError::NotFound(format!("no adapter registered for chain {chain:?}")));
        }
        self.active = chain;
        Ok(())
    }

    pub fn active_chain(&self) -> ChainKind {
        self.active
    }

    async fn anchor_on(&self, chain: ChainKind, payload: &AnchorPayload) -> AnchorOutcome {
        match self.adapters.get(&chain) {
            Some(adapter) => match adapter.anchor(payload).await {
                Ok(receipt) => AnchorOutcome {
                    chain,
                    receipt: Some(receipt),
                    error: None,
                },
                Err(e) => AnchorOutcome {
                    chain,
                    receipt: None,
                    error: Some(e.to_string()),
                },
            },
            None => AnchorOutcome {
                chain,
                receipt: None,
                error: Some(format!("no adapter registered for chain {chain:?}")),
            },
        }
    }

    /// Anchor on the active chain.
    pub async fn anchor(&self, payload: &AnchorPayload) -> AnchorOutcome {
        self.anchor_on(self.active, payload).await
    }

    /// Anchor on the active chain plus every chain in `redundant`,
    /// independently; a failure on one does not prevent the others
    /// ( "multi-chain anchoring (primary + redundant)").
    pub async fn anchor_multi(&self, payload: &AnchorPayload, redundant: &[ChainKind]) -> Vec<AnchorOutcome> {
        let mut outcomes = vec![self.anchor(payload).await];
        for &chain in redundant {
            if chain != self.active {
                outcomes.push(self.anchor_on(chain, payload).await);
            }
        }
        outcomes
    }

    pub async fn status_all(&self) -> Vec<AdapterHealth> {
        let mut out = Vec::with_capacity(self.adapters.len());
        for adapter in self.adapters.values() {
            out.push(adapter.status().await);
        }
        out.sort_by_key(|h| h.chain.label());
        out
    }
}

impl Default for LedgerAdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> AnchorPayload {
        AnchorPayload {
            sha256: Some("abc123".to_string()),
            document_id: Some("doc-1".to_string()),
            merkle_root: Some("feedface".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn wire_form_is_alphabetically_sorted() {
        let payload = sample_payload();
        assert_eq!(payload.wire_form(), "documentId:doc-1|merkleRoot:feedface|sha256:abc123");
    }

    #[test]
    fn wire_form_omits_absent_fields() {
        let payload = AnchorPayload {
            sku: Some("LEGAL-CONTRACT-US-2026-V1-ABCD".to_string()),
            ..Default::default()
        };
        assert_eq!(payload.wire_form(), "sku:LEGAL-CONTRACT-US-2026-V1-ABCD");
    }

    #[tokio::test]
    async fn offline_adapter_is_always_registered_and_healthy() {
        let registry = LedgerAdapterRegistry::new();
        assert_eq!(registry.active_chain(), ChainKind::Offline);
        let health = registry.status_all().await;
        assert!(health.iter().any(|h| h.chain == ChainKind::Offline && h.state == HealthState::Healthy));
    }

    #[tokio::test]
    async fn offline_anchor_round_trips_through_verify() {
        let registry = LedgerAdapterRegistry::new();
        let payload = sample_payload();
        let outcome = registry.anchor(&payload).await;
        let receipt = outcome.receipt.expect("offline anchor always succeeds");
        let adapter = OfflineAdapter;
        assert!(adapter.verify(&receipt, &payload).await.unwrap());
    }

    #[tokio::test]
    async fn setting_active_to_unregistered_chain_fails() {
        let mut registry = LedgerAdapterRegistry::new();
        assert!(registry.set_active(ChainKind::Xrpl).is_err());
    }

    #[tokio::test]
    async fn multi_anchor_reports_failure_for_unregistered_redundant_chain() {
        let registry = LedgerAdapterRegistry::new();
        let payload = sample_payload();
        let outcomes = registry.anchor_multi(&payload, &[ChainKind::Ipfs]).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].receipt.is_some());
        assert!(outcomes[1].error.is_some());
    }

    #[tokio::test]
    async fn unimplemented_adapter_reports_unavailable() {
        let mut registry = LedgerAdapterRegistry::new();
        registry.register(Box::new(UnimplementedAdapter(ChainKind::Ethereum)));
        registry.set_active(ChainKind::Ethereum).unwrap();
        let outcome = registry.anchor(&sample_payload()).await;
        assert!(outcome.receipt.is_none());
        assert!(outcome.error.is_some());
    }
}
