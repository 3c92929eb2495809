//! C4 — AccessTokenService: issue, validate (ordered checks), revoke, and
//! sweep-expire per-recipient access tokens.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use storage::JsonFileStore;

use crate::error::{SdcError, SdcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Used,
    Expired,
    Revoked,
    Locked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub org: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
    pub device: Option<String>,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token_id: String,
    pub token_secret: String,
    pub document_id: String,
    pub intake_id: String,
    pub recipient: Recipient,
    pub status: TokenStatus,
    pub remaining_uses: Option<u32>,
    pub max_uses: Option<u32>,
    pub bound_ip: Option<String>,
    pub bound_device: Option<String>,
    pub first_access_ip: Option<String>,
    pub first_access_device: Option<String>,
    pub otp_verified: bool,
    pub otp_required: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u32,
    pub access_log: Vec<AccessLogEntry>,
    pub token_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenFile {
    pub items: Vec<AccessToken>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub max_uses: Option<u32>,
    pub expiry_hours: Option<u32>,
    pub bound_ip: Option<String>,
    pub bound_device: Option<String>,
    pub otp_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub requires_otp: bool,
    pub requires_device_binding: bool,
    pub reason: Option<String>,
}

pub struct AccessTokenService {
    store: JsonFileStore<TokenFile>,
    file: TokenFile,
}

impl AccessTokenService {
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        let store: JsonFileStore<TokenFile> = JsonFileStore::new(path);
        let file = store.load();
        Self { store, file }
    }

    fn persist(&mut self) -> SdcResult<()> {
        self.file.last_updated = Some(Utc::now());
        self.store.save(&self.file).map_err(SdcError::Storage)
    }

    pub fn issue(
        &mut self,
        document_id: &str,
        intake_id: &str,
        recipient: Recipient,
        opts: IssueOptions,
    ) -> SdcResult<AccessToken> {
        let now = Utc::now();
        let expiry_hours = opts.expiry_hours.unwrap_or(168);
        let token_id = format!("tok-{}", crypto_primitives::SecureRandom::hex(8));
        let token_secret = crypto_primitives::SecureRandom::hex(32);
        let token_hash = crypto_primitives::sha256_hex(
            format!("{token_id}|{document_id}|{}|{}", recipient.email, now.to_rfc3339()).as_bytes(),
        );

        let token = AccessToken {
            token_id,
            token_secret,
            document_id: document_id.to_string(),
            intake_id: intake_id.to_string(),
            recipient,
            status: TokenStatus::Active,
            remaining_uses: opts.max_uses,
            max_uses: opts.max_uses,
            bound_ip: opts.bound_ip,
            bound_device: opts.bound_device,
            first_access_ip: None,
            first_access_device: None,
            otp_verified: false,
            otp_required: opts.otp_required,
            created_at: now,
            expires_at: now + Duration::hours(expiry_hours as i64),
            last_accessed_at: None,
            access_count: 0,
            access_log: Vec::new(),
            token_hash,
        };
        self.file.items.push(token.clone());
        self.persist()?;
        Ok(token)
    }

    fn index_of(&self, secret: &str) -> Option<usize> {
        self.file
            .items
            .iter()
            .position(|t| crypto_primitives::constant_time_eq(t.token_secret.as_bytes(), secret.as_bytes()))
    }

    /// Ordered validation checks. Every outcome — pass or fail — is
    /// appended to the token's access log before returning.
    pub fn validate(
        &mut self,
        secret: &str,
        ip: Option<&str>,
        device: Option<&str>,
    ) -> SdcResult<ValidationOutcome> {
        let idx = match self.index_of(secret) {
            Some(i) => i,
            None => {
                return Ok(ValidationOutcome {
                    valid: false,
                    requires_otp: false,
                    requires_device_binding: false,
                    reason: Some("Token not found".to_string()),
                })
            }
        };

        let now = Utc::now();
        let log_and_return = |service: &mut Self, outcome: ValidationOutcome| -> SdcResult<ValidationOutcome> {
            let reason = outcome.reason.clone().unwrap_or_else(|| "ok".to_string());
            service.file.items[idx].access_log.push(AccessLogEntry {
                timestamp: now,
                ip: ip.map(str::to_string),
                device: device.map(str::to_string),
                outcome: reason,
            });
            service.persist()?;
            Ok(outcome)
        };

        if self.file.items[idx].status != TokenStatus::Active {
            let reason = match self.file.items[idx].status {
                TokenStatus::Revoked => "Token has been revoked",
                TokenStatus::Locked => "Token is locked",
                TokenStatus::Used => "Token has no remaining uses",
                TokenStatus::Expired => "Token has expired",
                TokenStatus::Active => unreachable!(),
            };
            return log_and_return(
                self,
                ValidationOutcome {
                    valid: false,
                    requires_otp: false,
                    requires_device_binding: false,
                    reason: Some(reason.to_string()),
                },
            );
        }

        if now >= self.file.items[idx].expires_at {
            self.file.items[idx].status = TokenStatus::Expired;
            return log_and_return(
                self,
                ValidationOutcome {
                    valid: false,
                    requires_otp: false,
                    requires_device_binding: false,
                    reason: Some("Token has expired".to_string()),
                },
            );
        }

        if let Some(remaining) = self.file.items[idx].remaining_uses {
            if remaining == 0 {
                self.file.items[idx].status = TokenStatus::Used;
                return log_and_return(
                    self,
                    ValidationOutcome {
                        valid: false,
                        requires_otp: false,
                        requires_device_binding: false,
                        reason: Some("Token has no remaining uses".to_string()),
                    },
                );
            }
        }

        if let Some(bound_ip) = self.file.items[idx].bound_ip.clone() {
            if ip != Some(bound_ip.as_str()) {
                return log_and_return(
                    self,
                    ValidationOutcome {
                        valid: false,
                        requires_otp: false,
                        requires_device_binding: false,
                        reason: Some("IP mismatch".to_string()),
                    },
                );
            }
        }

        if let Some(bound_device) = self.file.items[idx].bound_device.clone() {
            if device != Some(bound_device.as_str()) {
                return log_and_return(
                    self,
                    ValidationOutcome {
                        valid: false,
                        requires_otp: false,
                        requires_device_binding: false,
                        reason: Some("Device mismatch".to_string()),
                    },
                );
            }
        }

        if self.file.items[idx].otp_required && !self.file.items[idx].otp_verified {
            return log_and_return(
                self,
                ValidationOutcome {
                    valid: false,
                    requires_otp: true,
                    requires_device_binding: false,
                    reason: None,
                },
            );
        }

        let first_access = self.file.items[idx].first_access_ip.is_none();
        if first_access {
            self.file.items[idx].first_access_ip = ip.map(str::to_string);
            self.file.items[idx].first_access_device = device.map(str::to_string);
        }
        self.file.items[idx].access_count += 1;
        if let Some(remaining) = self.file.items[idx].remaining_uses.as_mut() {
            *remaining -= 1;
        }
        self.file.items[idx].last_accessed_at = Some(now);
        let requires_device_binding = first_access && self.file.items[idx].bound_device.is_none();

        log_and_return(
            self,
            ValidationOutcome {
                valid: true,
                requires_otp: false,
                requires_device_binding,
                reason: None,
            },
        )
    }

    pub fn mark_otp_verified(&mut self, secret: &str) -> SdcResult<()> {
        let idx = self
            .index_of(secret)
            .ok_or_else(|| SdcError::NotFound("token".to_string()))?;
        self.file.items[idx].otp_verified = true;
        self.persist()
    }

    pub fn revoke(&mut self, token_id: &str) -> SdcResult<()> {
        let idx = self
            .file
            .items
            .iter()
            .position(|t| t.token_id == token_id)
            .ok_or_else(|| SdcError::NotFound(format!("token {token_id}")))?;
        self.file.items[idx].status = TokenStatus::Revoked;
        self.persist()
    }

    pub fn revoke_all_for_document(&mut self, document_id: &str) -> SdcResult<usize> {
        let mut count = 0;
        for token in self.file.items.iter_mut() {
            if token.document_id == document_id && token.status == TokenStatus::Active {
                token.status = TokenStatus::Revoked;
                count += 1;
            }
        }
        self.persist()?;
        Ok(count)
    }

    /// Sweep all active tokens whose `expiresAt` has passed; transition
    /// them to expired. Meant to run periodically.
    pub fn expire_stale(&mut self) -> SdcResult<usize> {
        let now = Utc::now();
        let mut count = 0;
        for token in self.file.items.iter_mut() {
            if token.status == TokenStatus::Active && token.expires_at < now {
                token.status = TokenStatus::Expired;
                count += 1;
            }
        }
        if count > 0 {
            self.persist()?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn recipient() -> Recipient {
        Recipient {
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            phone: None,
            org: None,
        }
    }

    #[test]
    fn s3_token_exhaustion() {
        let dir = tempdir().unwrap();
        let mut service = AccessTokenService::open(dir.path().join("sdc-tokens.json"));
        let token = service
            .issue(
                "doc-1",
                "intake-1",
                recipient(),
                IssueOptions {
                    max_uses: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();

        let r1 = service.validate(&token.token_secret, Some("1.2.3.4"), None).unwrap();
        assert!(r1.valid);
        let r2 = service.validate(&token.token_secret, Some("1.2.3.4"), None).unwrap();
        assert!(r2.valid);
        let r3 = service.validate(&token.token_secret, Some("1.2.3.4"), None).unwrap();
        assert!(!r3.valid);
        assert_eq!(r3.reason.as_deref(), Some("Token has no remaining uses"));
    }

    #[test]
    fn ip_mismatch_is_rejected_but_not_consumed() {
        let dir = tempdir().unwrap();
        let mut service = AccessTokenService::open(dir.path().join("sdc-tokens.json"));
        let token = service
            .issue(
                "doc-1",
                "intake-1",
                recipient(),
                IssueOptions {
                    max_uses: Some(1),
                    bound_ip: Some("9.9.9.9".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let outcome = service.validate(&token.token_secret, Some("1.1.1.1"), None).unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.reason.as_deref(), Some("IP mismatch"));

        let outcome = service.validate(&token.token_secret, Some("9.9.9.9"), None).unwrap();
        assert!(outcome.valid, "the unused use should still be available");
    }

    #[test]
    fn otp_required_holds_token_without_denying() {
        let dir = tempdir().unwrap();
        let mut service = AccessTokenService::open(dir.path().join("sdc-tokens.json"));
        let token = service
            .issue(
                "doc-1",
                "intake-1",
                recipient(),
                IssueOptions {
                    otp_required: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let outcome = service.validate(&token.token_secret, None, None).unwrap();
        assert!(!outcome.valid);
        assert!(outcome.requires_otp);
        assert!(outcome.reason.is_none());

        service.mark_otp_verified(&token.token_secret).unwrap();
        let outcome = service.validate(&token.token_secret, None, None).unwrap();
        assert!(outcome.valid);
    }

    #[test]
    fn revoke_all_for_document_is_bulk() {
        let dir = tempdir().unwrap();
        let mut service = AccessTokenService::open(dir.path().join("sdc-tokens.json"));
        service.issue("doc-1", "intake-1", recipient(), IssueOptions::default()).unwrap();
        service.issue("doc-1", "intake-1", recipient(), IssueOptions::default()).unwrap();
        service.issue("doc-2", "intake-2", recipient(), IssueOptions::default()).unwrap();

        let revoked = service.revoke_all_for_document("doc-1").unwrap();
        assert_eq!(revoked, 2);
    }
}
