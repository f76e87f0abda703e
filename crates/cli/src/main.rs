use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use medrec_core::config::{
    conflict_retries_from_env_value, emergency_limit_from_env_value,
    emergency_ttl_from_env_value, max_grant_duration_from_env_value,
};
use medrec_core::constants::DEFAULT_RECORD_DATA_DIR;
use medrec_core::emergency::{signing_key_from_pem, verifying_key_from_pem};
use medrec_core::{
    AccessLevel, ActorId, Caller, ClinicalPayload, CoreConfig, Decision, ErrorKind, FileStore,
    GrantRequest, NewRecord, Operation, Origin, RecordError, RecordId, RecordService,
    RecordStatus, RecordUpdate, RequestContext, Role,
};
use medrec_types::SingleLineText;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Service = RecordService<ClinicalPayload, FileStore<ClinicalPayload>>;

#[derive(Parser)]
#[command(name = "medrec")]
#[command(about = "Versioned medical record CLI")]
struct Cli {
    /// Authenticated caller id
    #[arg(long, global = true, env = "MEDREC_CALLER")]
    caller: Option<ActorId>,
    /// Caller role (admin, doctor, nurse, patient, emergency_responder)
    #[arg(long, global = true, env = "MEDREC_ROLE")]
    role: Option<Role>,
    /// Client address recorded in the audit trail
    #[arg(long, global = true)]
    origin_address: Option<String>,
    /// Client agent recorded in the audit trail
    #[arg(long, global = true)]
    origin_agent: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a record from a JSON payload file ("-" reads stdin)
    Create {
        /// Patient the record is about
        patient_id: ActorId,
        payload: PathBuf,
        /// Start as a draft instead of completed
        #[arg(long)]
        draft: bool,
        /// Include in the patient's emergency profile
        #[arg(long)]
        emergency: bool,
    },
    /// Replace a record's payload, creating a new version
    Update {
        record_id: RecordId,
        payload: PathBuf,
        #[arg(long)]
        reason: Option<String>,
        /// Fail instead of retrying if the record is no longer at this version
        #[arg(long)]
        expected_version: Option<u32>,
        #[arg(long)]
        status: Option<RecordStatus>,
        #[arg(long)]
        emergency: Option<bool>,
    },
    /// Show the current version of a record
    Show { record_id: RecordId },
    /// Show one version of a record
    Version { record_id: RecordId, version: u32 },
    /// List a record's versions
    History { record_id: RecordId },
    /// Invalidate a record, keeping its history
    Invalidate { record_id: RecordId, reason: String },
    /// Grant another user access to a record
    Grant {
        record_id: RecordId,
        grantee_id: ActorId,
        /// read, write or full
        level: AccessLevel,
        #[arg(long)]
        purpose: Option<String>,
        /// RFC 3339 timestamp, e.g. 2026-03-01T10:00:00Z
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Revoke a user's grant on a record
    Revoke {
        record_id: RecordId,
        grantee_id: ActorId,
    },
    /// Show the caller's access decision for an operation
    CheckAccess {
        record_id: RecordId,
        /// read, write, share or invalidate
        operation: Operation,
    },
    /// List active grants on a record
    Grants { record_id: RecordId },
    /// Show a record's audit trail
    Audit { record_id: RecordId },
    /// Show audit entries on every record about a user
    AuditUser { user_id: ActorId },
    /// List a patient's valid records visible to the caller
    Records { patient_id: ActorId },
    /// Show a patient's emergency profile
    Emergency { patient_id: ActorId },
    /// Issue a single-use emergency token
    IssueToken {
        patient_id: ActorId,
        /// PEM string, PEM file path or base64 PEM of the P-256 signing key
        #[arg(long, env = "MEDREC_EMERGENCY_SIGNING_KEY", hide_env_values = true)]
        signing_key: String,
    },
    /// Redeem an emergency token
    RedeemToken {
        token: String,
        /// PEM string, PEM file path or base64 PEM of the P-256 verifying key
        #[arg(long, env = "MEDREC_EMERGENCY_VERIFYING_KEY")]
        verifying_key: String,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<RecordError>().map(RecordError::kind) {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::NotFound) => 3,
        Some(ErrorKind::Authorization) => 4,
        Some(ErrorKind::Conflict) => 5,
        Some(ErrorKind::StorageUnavailable) => 6,
        None => 1,
    }
}

/// Resolves configuration from `MEDREC_*` environment variables once at startup.
fn load_config() -> anyhow::Result<CoreConfig> {
    let var = |name: &str| std::env::var(name).ok();

    let data_dir = var("MEDREC_DATA_DIR").unwrap_or_else(|| DEFAULT_RECORD_DATA_DIR.into());
    let mut cfg = CoreConfig::new(PathBuf::from(data_dir))?
        .with_emergency_profile_limit(emergency_limit_from_env_value(var(
            "MEDREC_EMERGENCY_LIMIT",
        ))?)?
        .with_emergency_token_ttl(emergency_ttl_from_env_value(var(
            "MEDREC_EMERGENCY_TTL_HOURS",
        ))?)?
        .with_max_grant_duration(max_grant_duration_from_env_value(var(
            "MEDREC_MAX_GRANT_DAYS",
        ))?)?
        .with_max_conflict_retries(conflict_retries_from_env_value(var(
            "MEDREC_CONFLICT_RETRIES",
        ))?)?;
    if let Some(location) = var("MEDREC_CARE_LOCATION") {
        cfg = cfg.with_care_location(location)?;
    }
    Ok(cfg)
}

fn read_payload(path: &Path) -> anyhow::Result<ClinicalPayload> {
    let mut raw = String::new();
    if path == Path::new("-") {
        std::io::stdin().read_to_string(&mut raw)?;
    } else {
        raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading payload {}", path.display()))?;
    }
    serde_json::from_str(&raw).context("payload is not a valid clinical payload")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn optional_text(value: Option<String>) -> anyhow::Result<Option<SingleLineText>> {
    Ok(value.map(SingleLineText::new).transpose()?)
}

/// Token redemption is anonymous; the token itself is the credential.
fn redeem(service: &Service, token: &str, verifying_key: &str, origin: &Origin) -> anyhow::Result<()> {
    let key = verifying_key_from_pem(verifying_key)?;
    let profile = service.redeem_emergency_token(token, &key, origin, Utc::now())?;
    print_json(&profile)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("medrec_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = Arc::new(load_config()?);
    tracing::debug!(data_dir = %cfg.record_data_dir().display(), "configuration loaded");
    let service: Service = RecordService::new(cfg.clone(), FileStore::new(cfg));
    let origin = Origin::new(cli.origin_address, cli.origin_agent);

    match cli.command {
        Commands::RedeemToken {
            token,
            verifying_key,
        } => redeem(&service, &token, &verifying_key, &origin),
        command => {
            let caller = match (cli.caller, cli.role) {
                (Some(id), Some(role)) => Caller::new(id, role),
                _ => anyhow::bail!(
                    "--caller and --role (or MEDREC_CALLER and MEDREC_ROLE) are required"
                ),
            };
            run_as(&service, &RequestContext::new(caller, origin), command)
        }
    }
}

fn run_as(service: &Service, ctx: &RequestContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Create {
            patient_id,
            payload,
            draft,
            emergency,
        } => {
            let mut new = NewRecord::new(patient_id, read_payload(&payload)?);
            if draft {
                new.status = RecordStatus::Draft;
            }
            new.emergency_accessible = emergency;
            let record = service.create_record(ctx, new)?;
            println!("Created record {} (version {})", record.id(), record.version());
        }
        Commands::Update {
            record_id,
            payload,
            reason,
            expected_version,
            status,
            emergency,
        } => {
            let mut update = RecordUpdate::new(read_payload(&payload)?, optional_text(reason)?);
            update.expected_version = expected_version;
            update.status = status;
            update.emergency_accessible = emergency;
            let record = service.update_record(ctx, record_id, update)?;
            println!("Updated record {} to version {}", record.id(), record.version());
        }
        Commands::Show { record_id } => {
            let record = service.get_record(ctx, record_id)?;
            print_json(&record.current_view())?;
        }
        Commands::Version { record_id, version } => {
            print_json(&service.get_version(ctx, record_id, version)?)?;
        }
        Commands::History { record_id } => {
            print_json(&service.history(ctx, record_id)?)?;
        }
        Commands::Invalidate { record_id, reason } => {
            let reason = SingleLineText::new(reason)?;
            service.invalidate(ctx, record_id, reason)?;
            println!("Invalidated record {record_id}");
        }
        Commands::Grant {
            record_id,
            grantee_id,
            level,
            purpose,
            expires_at,
        } => {
            let grant = service.grant_access(
                ctx,
                GrantRequest {
                    record_id,
                    grantee_id,
                    level,
                    purpose: optional_text(purpose)?,
                    expires_at,
                },
            )?;
            print_json(&grant)?;
        }
        Commands::Revoke {
            record_id,
            grantee_id,
        } => match service.revoke_access(ctx, record_id, &grantee_id)? {
            Some(grant) => println!("Revoked {} access for {grantee_id}", grant.level),
            None => println!("No grant for {grantee_id} on record {record_id}"),
        },
        Commands::CheckAccess {
            record_id,
            operation,
        } => match service.check_access(ctx, record_id, operation)? {
            Decision::Allow { level, basis } => println!("allowed: {level} access ({basis})"),
            Decision::Deny(reason) => println!("denied: {reason}"),
        },
        Commands::Grants { record_id } => {
            print_json(&service.list_grants(ctx, record_id)?)?;
        }
        Commands::Audit { record_id } => {
            print_json(&service.audit_for_record(ctx, record_id)?)?;
        }
        Commands::AuditUser { user_id } => {
            print_json(&service.audit_for_user(ctx, &user_id)?)?;
        }
        Commands::Records { patient_id } => {
            let records = service.list_active_records(ctx, &patient_id)?;
            if records.is_empty() {
                println!("No records found.");
            }
            for record in records {
                println!(
                    "ID: {}, Version: {}, Status: {}, Updated: {}",
                    record.id(),
                    record.version(),
                    record.status(),
                    record.updated_at().to_rfc3339()
                );
            }
        }
        Commands::Emergency { patient_id } => {
            print_json(&service.emergency_profile(ctx, &patient_id)?)?;
        }
        Commands::IssueToken {
            patient_id,
            signing_key,
        } => {
            let key = signing_key_from_pem(&signing_key)?;
            print_json(&service.issue_emergency_token(ctx, &patient_id, &key)?)?;
        }
        Commands::RedeemToken {
            token,
            verifying_key,
        } => redeem(service, &token, &verifying_key, &ctx.origin)?,
    }

    Ok(())
}
