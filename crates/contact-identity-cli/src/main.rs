use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use contact_identity_core::{ContactId, ContactStore, IdentityError, StoreError};
use contact_identity_engine::{Reconciler, ReconcilerConfig};
use contact_identity_store_sqlite::SqliteContactStore;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cid")]
#[command(about = "Contact identity reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./contact_identity.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 2_000)]
    lock_timeout_ms: u64,

    #[arg(long, default_value_t = 4)]
    max_lock_rounds: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile one observation and print the resulting identity.
    Identify(IdentifyArgs),
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    Contacts {
        #[command(subcommand)]
        command: ContactsCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    Show {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Subcommand)]
enum ContactsCommand {
    List,
    Audit,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    IntegrityCheck,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(fmt_layer)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let store = SqliteContactStore::open(&cli.db).map_err(store_failure)?;
    let config = ReconcilerConfig::default()
        .with_lock_timeout(Duration::from_millis(cli.lock_timeout_ms))
        .with_max_lock_rounds(cli.max_lock_rounds);
    let reconciler = Reconciler::with_config(store, config);
    tracing::debug!(
        db = %cli.db.display(),
        config = ?reconciler.config(),
        "opened contact store"
    );

    match cli.command {
        Command::Identify(args) => run_identify(&args, &reconciler),
        Command::Identity { command } => run_identity(&command, &reconciler),
        Command::Contacts { command } => run_contacts(&command, &reconciler),
        Command::Db { command } => run_db(&command, reconciler.store()),
    }
}

fn run_identify(
    args: &IdentifyArgs,
    reconciler: &Reconciler<SqliteContactStore>,
) -> Result<()> {
    let view = reconciler.reconcile(args.email.as_deref(), args.phone.as_deref())?;
    let value = serde_json::to_value(&view).context("failed to serialize identity view")?;
    emit_json(value)
}

fn run_identity(
    command: &IdentityCommand,
    reconciler: &Reconciler<SqliteContactStore>,
) -> Result<()> {
    match command {
        IdentityCommand::Show { id } => {
            let contact_id = ContactId(*id);
            let view = reconciler
                .identity_of(contact_id)?
                .ok_or_else(|| anyhow!("contact {contact_id} does not exist"))?;
            let value = serde_json::to_value(&view).context("failed to serialize identity view")?;
            emit_json(value)
        }
    }
}

fn run_contacts(
    command: &ContactsCommand,
    reconciler: &Reconciler<SqliteContactStore>,
) -> Result<()> {
    match command {
        ContactsCommand::List => {
            let store = reconciler.store();
            let contacts = store.list_contacts().map_err(IdentityError::from)?;
            emit_json(serde_json::json!({ "contacts": contacts }))
        }
        ContactsCommand::Audit => {
            let findings = reconciler.audit()?;
            emit_json(serde_json::json!({
                "clean": findings.is_empty(),
                "findings": findings,
            }))
        }
    }
}

fn run_db(command: &DbCommand, store: &SqliteContactStore) -> Result<()> {
    match command {
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check().map_err(store_failure)?;
            let value = serde_json::to_value(&report).context("failed to serialize report")?;
            emit_json(value)
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(&with_contract_version(value))?;
    println!("{rendered}");
    Ok(())
}

/// 2 validation, 3 conflict (retryable), 4 store, 5 invariant violation,
/// 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<IdentityError>() {
        Some(IdentityError::Validation(_)) => 2,
        Some(IdentityError::Conflict(_)) => 3,
        Some(IdentityError::Store(_)) => 4,
        Some(IdentityError::InvariantViolation(_)) => 5,
        None if err.is::<StoreError>() => 4,
        None => 1,
    }
}

/// Classifies a failure from the SQLite layer as a store error.
#[allow(clippy::needless_pass_by_value)]
fn store_failure(err: anyhow::Error) -> IdentityError {
    IdentityError::Store(StoreError::new(format!("{err:#}")))
}
