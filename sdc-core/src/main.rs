use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

mod canonical;
mod certificate;
mod config;
mod diff;
mod document;
mod error;
mod export_policy;
mod intake;
mod ledger;
mod ledger_adapter;
mod metrics;
mod orchestrator;
mod rate_limiter;
mod tokens;
mod watermark;
mod webhook;

use config::SdcConfig;
use document::DocumentObject;
use export_policy::{ExportFormat, ExportPolicyEngine, ExportRequest};
use intake::{ExportPolicy as IntakeExportPolicy, IntakeEngine, IntakeState, WatermarkPolicy as IntakeWatermarkPolicy};
use ledger::ChainLedger;
use ledger_adapter::{AnchorPayload, ChainKind, LedgerAdapterRegistry};
use orchestrator::{AccessEvent, ConversationEvent, Orchestrator, PerimeterEvent};
use rate_limiter::RateLimiter;
use tokens::AccessTokenService;
use webhook::WebhookValidator;

/// Sovereign document control and integrity platform CLI.
#[derive(Parser)]
#[command(name = "sdc")]
#[command(about = "Canonicalize, ledger, and gate sovereign documents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a DocumentObject JSON file through intake: classify, tier,
    /// open an IntakeRecord, and log the ingest to the perimeter ledger.
    Ingest {
        document: PathBuf,
        document_id: String,
        #[arg(long, default_value = "owner@example.com")]
        owner: String,
        #[arg(long, default_value = "US")]
        jurisdiction: String,
        #[arg(long)]
        year: Option<u32>,
    },
    /// Print a document's canonical hash.
    Canonicalize { document: PathBuf },
    /// Re-hash a document `rounds` times and confirm stability.
    HashStability {
        document: PathBuf,
        #[arg(long, default_value_t = 1000)]
        rounds: usize,
    },
    /// Advance an IntakeRecord's lifecycle state.
    Lifecycle {
        document_id: String,
        to: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[arg(long, default_value = "manual transition")]
        reason: String,
    },
    /// Issue a self-hashed signature certificate for a document.
    Sign {
        document: PathBuf,
        document_id: String,
        signer_name: String,
        signer_email: String,
    },
    /// Gate and watermark an export request.
    Export {
        document: PathBuf,
        document_id: String,
        recipient_name: String,
        recipient_email: String,
        #[arg(long, default_value = "html")]
        format: String,
        #[arg(long, default_value = "VIEW_ONLY")]
        export_policy: String,
        #[arg(long, default_value = "STANDARD")]
        watermark_policy: String,
    },
    /// Compute a placeholder encrypted-at-rest content reference. Not a
    /// cryptographic module in its own right (no symmetric cipher is
    /// part of this crate's component set) — produces the `encryptedCID`
    /// fingerprint the anchor payload carries.
    Encrypt { document: PathBuf },
    /// Anchor a document's fingerprints on the named chain.
    LedgerAnchor {
        chain: String,
        document_id: String,
        #[arg(long)]
        sha256: Option<String>,
        #[arg(long)]
        merkle_root: Option<String>,
    },
    /// Structural diff between two DocumentObject JSON files.
    Diff { a: PathBuf, b: PathBuf },
    /// Run the chain-integrity sweep across all three ledgers.
    LedgerStatus,
}

fn load_document(path: &PathBuf) -> Result<DocumentObject> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing DocumentObject from {}", path.display()))
}

fn parse_intake_state(s: &str) -> Result<IntakeState> {
    let normalized = s.to_uppercase();
    serde_json::from_value(serde_json::Value::String(normalized))
        .with_context(|| format!("unknown lifecycle state '{s}'"))
}

fn parse_export_policy(s: &str) -> Result<IntakeExportPolicy> {
    serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
        .with_context(|| format!("unknown export policy '{s}'"))
}

fn parse_watermark_policy(s: &str) -> Result<IntakeWatermarkPolicy> {
    serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
        .with_context(|| format!("unknown watermark policy '{s}'"))
}

fn parse_export_format(s: &str) -> Result<ExportFormat> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .with_context(|| format!("unknown export format '{s}'"))
}

fn parse_chain(s: &str) -> Result<ChainKind> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .with_context(|| format!("unknown chain '{s}'"))
}

fn build_orchestrator(cfg: &SdcConfig) -> Orchestrator {
    std::fs::create_dir_all(&cfg.data_dir).ok();
    Orchestrator::new(
        IntakeEngine::open(cfg.intake_path()),
        AccessTokenService::open(cfg.tokens_path()),
        ExportPolicyEngine::open(cfg.export_log_path()),
        WebhookValidator::new(vec![], cfg.webhook_signing_secret.clone()),
        RateLimiter::with_defaults(),
        LedgerAdapterRegistry::new(),
        ChainLedger::<PerimeterEvent>::open("perimeter", cfg.perimeter_ledger_path()),
        ChainLedger::<AccessEvent>::open("access", cfg.access_ledger_path()),
        ChainLedger::<ConversationEvent>::open("conversation", cfg.conversation_ledger_path()),
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli.command).await {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_ansi(true))
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();
}

async fn run(command: Commands) -> Result<()> {
    let cfg = SdcConfig::load().unwrap_or_default();

    match command {
        Commands::Ingest { document, document_id, owner, jurisdiction, year } => {
            let doc = load_document(&document)?;
            let mut orch = build_orchestrator(&cfg);
            let year = year.unwrap_or(2026);
            let outcome = orch.ingest(&doc, &document_id, &owner, &jurisdiction, year, None)?;
            println!(
                "{}",
                serde_json::json!({
                    "documentId": document_id,
                    "sku": outcome.sku,
                    "documentHash": outcome.document_hash,
                    "classification": outcome.intake_record.classification,
                    "riskTier": outcome.intake_record.risk_tier,
                    "state": outcome.intake_record.state,
                })
            );
            Ok(())
        }
        Commands::Canonicalize { document } => {
            let doc = load_document(&document)?;
            let hash = canonical::canonical_hash_hex(&doc);
            println!("{hash}");
            Ok(())
        }
        Commands::HashStability { document, rounds } => {
            let doc = load_document(&document)?;
            match canonical::run_hash_stability_test(&doc, rounds) {
                None => {
                    println!("stable across {rounds} rounds");
                    Ok(())
                }
                Some(round) => anyhow::bail!("canonical hash diverged at round {round}"),
            }
        }
        Commands::Lifecycle { document_id, to, actor, reason } => {
            let target = parse_intake_state(&to)?;
            let mut orch = build_orchestrator(&cfg);
            let record = orch.advance_lifecycle(&document_id, target, &actor, &reason)?;
            println!("{}", serde_json::json!({ "documentId": document_id, "state": record.state }));
            Ok(())
        }
        Commands::Sign { document, document_id, signer_name, signer_email } => {
            let doc = load_document(&document)?;
            let document_hash = canonical::canonical_hash_hex(&doc);
            let merkle_root = hex::encode(canonical::canonical_merkle_root(&doc));
            let mut orch = build_orchestrator(&cfg);
            let cert = orch.issue_certificate(
                &document_id,
                certificate::SignatureCertificateBody {
                    document_hash,
                    merkle_root,
                    signer_name,
                    signer_email,
                    signature_hash: crypto_primitives::sha256_hex(document_id.as_bytes()),
                    previous_signature_hash: None,
                    chain_position: 1,
                    timestamp: chrono::Utc::now(),
                    consent: certificate::ConsentRecord {
                        method: "cli".to_string(),
                        timestamp: chrono::Utc::now(),
                        ip: None,
                    },
                    device: certificate::DeviceAttestation {
                        fingerprint: "cli-session".to_string(),
                        platform: std::env::consts::OS.to_string(),
                        user_agent: "sdc-cli".to_string(),
                    },
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&cert)?);
            Ok(())
        }
        Commands::Export { document, document_id, recipient_name, recipient_email, format, export_policy, watermark_policy } => {
            let doc = load_document(&document)?;
            let req = ExportRequest {
                document_id,
                title: doc.metadata.title.clone(),
                recipient_name,
                recipient_email,
                recipient_ip: None,
                export_policy: parse_export_policy(&export_policy)?,
                watermark_policy: parse_watermark_policy(&watermark_policy)?,
                format: parse_export_format(&format)?,
                content: doc.raw_text.clone(),
            };
            let mut orch = build_orchestrator(&cfg);
            let outcome = orch.export(&req)?;
            if !outcome.record.allowed {
                anyhow::bail!(outcome.record.denial_reason.unwrap_or_else(|| "export denied".to_string()));
            }
            println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            Ok(())
        }
        Commands::Encrypt { document } => {
            let doc = load_document(&document)?;
            let document_hash = canonical::canonical_hash_hex(&doc);
            let key = crypto_primitives::SecureRandom::hex(32);
            let encrypted_cid = crypto_primitives::sha256_hex(format!("{document_hash}:{key}").as_bytes());
            println!("{}", serde_json::json!({ "encryptedCID": encrypted_cid }));
            Ok(())
        }
        Commands::LedgerAnchor { chain, document_id, sha256, merkle_root } => {
            let chain = parse_chain(&chain)?;
            let mut orch = build_orchestrator(&cfg);
            orch.ledger_adapters.set_active(chain).unwrap_or(());
            let payload = AnchorPayload {
                sha256,
                merkle_root,
                document_id: Some(document_id.clone()),
                protocol_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                ..Default::default()
            };
            let receipt = orch.anchor_document(&document_id, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        Commands::Diff { a, b } => {
            let doc_a = load_document(&a)?;
            let doc_b = load_document(&b)?;
            let result = diff::diff(&doc_a, &doc_b);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::LedgerStatus => {
            let orch = build_orchestrator(&cfg);
            let health = orch.health();
            info!(?health, "ledger status");
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.perimeter_intact || !health.access_intact || !health.conversation_intact {
                anyhow::bail!("one or more ledgers failed integrity verification");
            }
            Ok(())
        }
    }
}
