// crates/lochness-cli/src/main.rs
// ============================================================================
// Module: Lochness CLI Entry Point
// Description: Command dispatcher for the sync engine, vault, and catalog.
// Purpose: Operate the scheduler and administer credentials and instances.
// Dependencies: clap, lochness-config, lochness-sync, lochness-vault, tokio, tracing
// ============================================================================

//! ## Overview
//! The Lochness CLI loads `lochness.toml` (or `LOCHNESS_CONFIG`), opens the
//! `SQLite` store, and dispatches one command. Machine-readable results go to
//! stdout as JSON lines; logs go to stderr as text or JSON. Credential input is
//! read from stdin only, so secrets never appear in argv or shell history.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use lochness_config::LochnessConfig;
use lochness_connectors::ConnectorRegistry;
use lochness_connectors::MemoryBackends;
use lochness_core::CatalogStore;
use lochness_core::CheckpointError;
use lochness_core::CheckpointStore;
use lochness_core::DataSinkInstance;
use lochness_core::DataSourceInstance;
use lochness_core::InstanceRef;
use lochness_core::RunOutcome;
use lochness_core::Secret;
use lochness_core::SourceInstanceId;
use lochness_core::SyncRunStore;
use lochness_store_sqlite::SqliteStore;
use lochness_sync::JsonLinesEventSink;
use lochness_sync::Orchestrator;
use lochness_sync::Scheduler;
use lochness_sync::SyncEventSink;
use lochness_sync::SyncServices;
use lochness_sync::SyncSettings;
use lochness_sync::TracingEventSink;
use lochness_vault::Vault;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::de::IgnoredAny;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum size of a registration document.
const MAX_REGISTRATION_BYTES: usize = 1024 * 1024;
/// Maximum size of a credential document read from stdin.
const MAX_CREDENTIAL_BYTES: usize = 64 * 1024;
/// Default number of runs listed by `runs`.
const DEFAULT_RUN_LIMIT: usize = 20;
/// Environment variable holding the log filter.
const LOG_ENV: &str = "LOCHNESS_LOG";

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "lochness", version, about = "Incremental research data sync with a credential vault")]
struct Cli {
    /// Config file path (defaults to `lochness.toml` or `LOCHNESS_CONFIG`).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Log output format on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Log output formats.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Recover abandoned runs, then run the scheduler until Ctrl-C.
    Serve,
    /// Run one source instance once and print the run report.
    Sync(SyncCommand),
    /// Credential vault administration.
    Credential {
        /// Selected credential subcommand.
        #[command(subcommand)]
        command: CredentialCommand,
    },
    /// Print sync run history as JSON lines.
    Runs(RunsCommand),
    /// Register a catalog instance from a JSON document.
    Register {
        /// Selected register subcommand.
        #[command(subcommand)]
        command: RegisterCommand,
    },
    /// Print the stored checkpoint of a source instance.
    Checkpoint(CheckpointCommand),
}

/// Arguments for `sync`.
#[derive(Args, Debug)]
struct SyncCommand {
    /// Source instance identifier.
    #[arg(long, value_name = "ID")]
    instance: String,
}

/// Credential subcommands.
#[derive(Subcommand, Debug)]
enum CredentialCommand {
    /// Store (or rotate) a credential read as JSON from stdin.
    Put(CredentialPutCommand),
    /// List stored versions without plaintext.
    Versions(CredentialVersionsCommand),
}

/// Arguments for `credential put`.
#[derive(Args, Debug)]
struct CredentialPutCommand {
    /// Credential reference named by catalog instances.
    #[arg(long = "ref", value_name = "REF")]
    reference: String,
    /// Connector type whose credential fields are required.
    #[arg(long = "type", value_name = "TYPE")]
    connector_type: String,
    /// Add a new active version instead of creating the first one.
    #[arg(long)]
    rotate: bool,
}

/// Arguments for `credential versions`.
#[derive(Args, Debug)]
struct CredentialVersionsCommand {
    /// Credential reference.
    #[arg(long = "ref", value_name = "REF")]
    reference: String,
}

/// Arguments for `runs`.
#[derive(Args, Debug)]
struct RunsCommand {
    /// Source instance identifier.
    #[arg(long, value_name = "ID")]
    instance: String,
    /// Maximum number of runs, newest first.
    #[arg(long, default_value_t = DEFAULT_RUN_LIMIT)]
    limit: usize,
}

/// Register subcommands.
#[derive(Subcommand, Debug)]
enum RegisterCommand {
    /// Register a data source instance.
    Source(RegisterFileArgs),
    /// Register a data sink instance.
    Sink(RegisterFileArgs),
}

/// Registration document location.
#[derive(Args, Debug)]
struct RegisterFileArgs {
    /// JSON document describing the instance.
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
}

/// Arguments for `checkpoint`.
#[derive(Args, Debug)]
struct CheckpointCommand {
    /// Source instance identifier.
    #[arg(long, value_name = "ID")]
    instance: String,
}

// ============================================================================
// SECTION: Output Types
// ============================================================================

/// Result of `credential put`.
#[derive(Debug, Serialize)]
struct CredentialStored<'a> {
    /// Credential reference.
    instance_ref: &'a str,
    /// Version now active.
    version: u32,
    /// True when an existing credential was rotated.
    rotated: bool,
}

/// One line of `credential versions`.
#[derive(Debug, Serialize)]
struct CredentialVersionLine {
    /// Credential reference.
    instance_ref: String,
    /// Version number.
    version: u32,
    /// True for the version connectors use.
    active: bool,
    /// Cipher label.
    algorithm: String,
    /// Creation time (RFC 3339).
    created_at: String,
}

/// Result of `register`.
#[derive(Debug, Serialize)]
struct Registered<'a> {
    /// Instance kind (`source` or `sink`).
    kind: &'static str,
    /// Instance identifier.
    id: &'a str,
    /// Connector type.
    connector_type: &'a str,
}

/// Result of `checkpoint`.
#[derive(Debug, Serialize)]
struct CheckpointLine<'a> {
    /// Source instance identifier.
    instance: &'a str,
    /// Stored watermark, absent before the first advance.
    watermark: Option<String>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error carrying a one-line message.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

/// Errors raised while reading bounded input.
#[derive(Debug, Error)]
enum ReadLimitError {
    /// I/O failure while reading.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Input exceeded the size limit.
    #[error("input exceeds size limit ({size} > {limit} bytes)")]
    TooLarge {
        /// Observed size in bytes.
        size: u64,
        /// Allowed limit in bytes.
        limit: usize,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Parses arguments, initializes logging, and dispatches the command.
async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => command_serve(&config).await,
        Commands::Sync(command) => command_sync(&config, &command).await,
        Commands::Credential {
            command,
        } => match command {
            CredentialCommand::Put(command) => command_credential_put(&config, &command),
            CredentialCommand::Versions(command) => command_credential_versions(&config, &command),
        },
        Commands::Runs(command) => command_runs(&config, &command),
        Commands::Register {
            command,
        } => command_register(&config, &command),
        Commands::Checkpoint(command) => command_checkpoint(&config, &command),
    }
}

/// Installs the global `tracing` subscriber writing to stderr.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        let _ = write_stderr_line("warning: a log subscriber was already installed");
    }
}

/// Loads and validates configuration, logging its warnings.
fn load_config(path: Option<&Path>) -> CliResult<LochnessConfig> {
    let config = LochnessConfig::load(path).map_err(|err| CliError::new(err.to_string()))?;
    for warning in &config.warnings {
        warn!(%warning, "configuration warning");
    }
    Ok(config)
}

// ============================================================================
// SECTION: Wiring
// ============================================================================

/// Opens the `SQLite` store named by the configuration.
fn open_store(config: &LochnessConfig) -> CliResult<SqliteStore> {
    SqliteStore::new(&config.database)
        .map_err(|err| CliError::new(format!("cannot open store {}: {err}", config.database.path.display())))
}

/// Unlocks the vault over `store`.
fn unlock_vault(config: &LochnessConfig, store: &SqliteStore) -> CliResult<Vault> {
    let passphrase = config.vault.passphrase().map_err(|err| CliError::new(err.to_string()))?;
    Vault::unlock(Arc::new(store.clone()), passphrase.as_bytes(), config.vault.kdf)
        .map_err(|err| CliError::new(format!("cannot unlock vault: {err}")))
}

/// Builds the connector registry from configuration.
fn build_registry(config: &LochnessConfig) -> CliResult<ConnectorRegistry> {
    ConnectorRegistry::with_builtin_connectors(&config.connectors, &MemoryBackends::default())
        .map_err(|err| CliError::new(err.to_string()))
}

/// Builds the event sink selected by configuration.
fn build_event_sink(config: &LochnessConfig) -> CliResult<Arc<dyn SyncEventSink>> {
    match &config.events.jsonl_path {
        Some(path) => {
            let sink = JsonLinesEventSink::new(path).map_err(|err| {
                CliError::new(format!("cannot open event log {}: {err}", path.display()))
            })?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingEventSink)),
    }
}

/// Wires an orchestrator over one `SQLite` store.
fn build_orchestrator(config: &LochnessConfig, store: &SqliteStore) -> CliResult<Orchestrator> {
    let vault = unlock_vault(config, store)?;
    let services = SyncServices {
        catalog: Arc::new(store.clone()),
        checkpoints: Arc::new(store.clone()),
        runs: Arc::new(store.clone()),
        vault: Arc::new(vault),
        registry: Arc::new(build_registry(config)?),
        events: build_event_sink(config)?,
    };
    Ok(Orchestrator::new(services, SyncSettings::from_config(&config.sync)))
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; stopping");
                token.cancel();
            }
            Err(err) => warn!(error = %err, "cannot listen for interrupts"),
        }
    })
}

// ============================================================================
// SECTION: Sync Commands
// ============================================================================

/// Executes `serve`.
async fn command_serve(config: &LochnessConfig) -> CliResult<ExitCode> {
    let store = open_store(config)?;
    let orchestrator = Arc::new(build_orchestrator(config, &store)?);
    let abandoned = orchestrator.recover().map_err(|err| CliError::new(err.to_string()))?;
    if !abandoned.is_empty() {
        info!(count = abandoned.len(), "abandoned runs recovered");
    }
    let scheduler = Scheduler::new(orchestrator, config.scheduler.workers);
    let stop = CancellationToken::new();
    let listener = cancel_on_ctrl_c(stop.clone());
    scheduler.run(Duration::from_secs(config.scheduler.interval_secs), &stop).await;
    listener.abort();
    Ok(ExitCode::SUCCESS)
}

/// Executes `sync`.
async fn command_sync(config: &LochnessConfig, command: &SyncCommand) -> CliResult<ExitCode> {
    let store = open_store(config)?;
    let orchestrator = build_orchestrator(config, &store)?;
    let cancel = CancellationToken::new();
    let listener = cancel_on_ctrl_c(cancel.clone());
    let instance = SourceInstanceId::new(command.instance.as_str());
    let run = orchestrator.run_once(&instance, &cancel).await;
    listener.abort();
    let run = run.map_err(|err| CliError::new(err.to_string()))?;
    write_json_line(&run)?;
    Ok(if run.outcome == RunOutcome::Failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Executes `runs`.
fn command_runs(config: &LochnessConfig, command: &RunsCommand) -> CliResult<ExitCode> {
    let store = open_store(config)?;
    let runs = store
        .list_runs(&SourceInstanceId::new(command.instance.as_str()), command.limit)
        .map_err(|err| CliError::new(err.to_string()))?;
    for run in &runs {
        write_json_line(run)?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `checkpoint`.
fn command_checkpoint(config: &LochnessConfig, command: &CheckpointCommand) -> CliResult<ExitCode> {
    let store = open_store(config)?;
    let watermark = match store.get(&SourceInstanceId::new(command.instance.as_str())) {
        Ok(watermark) => Some(watermark.to_string()),
        Err(CheckpointError::NotFound(_)) => None,
        Err(err) => return Err(CliError::new(err.to_string())),
    };
    write_json_line(&CheckpointLine {
        instance: &command.instance,
        watermark,
    })?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Credential Commands
// ============================================================================

/// Executes `credential put`.
fn command_credential_put(config: &LochnessConfig, command: &CredentialPutCommand) -> CliResult<ExitCode> {
    let secret = read_credential(&mut std::io::stdin().lock())?;
    let registry = build_registry(config)?;
    validate_credential_for_type(&registry, &command.connector_type, &secret)?;

    let store = open_store(config)?;
    let vault = unlock_vault(config, &store)?;
    let instance_ref = InstanceRef::new(command.reference.as_str());
    let stored = if command.rotate {
        vault.rotate(&instance_ref, secret.expose())
    } else {
        vault.store(&instance_ref, secret.expose())
    }
    .map_err(|err| CliError::new(err.to_string()))?;
    drop(secret);
    vault.close();

    write_json_line(&CredentialStored {
        instance_ref: &command.reference,
        version: stored.version,
        rotated: command.rotate,
    })?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `credential versions`.
fn command_credential_versions(
    config: &LochnessConfig,
    command: &CredentialVersionsCommand,
) -> CliResult<ExitCode> {
    let store = open_store(config)?;
    let vault = unlock_vault(config, &store)?;
    let versions = vault
        .versions(&InstanceRef::new(command.reference.as_str()))
        .map_err(|err| CliError::new(err.to_string()))?;
    vault.close();
    if versions.is_empty() {
        return Err(CliError::new(format!("no credential stored for {}", command.reference)));
    }
    for version in versions {
        write_json_line(&CredentialVersionLine {
            instance_ref: version.reference.instance_ref.to_string(),
            version: version.reference.version,
            active: version.active,
            algorithm: version.algorithm,
            created_at: version.created_at.to_rfc3339(),
        })?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Reads a credential document and checks it is a JSON object.
fn read_credential(input: &mut impl Read) -> CliResult<Secret> {
    let mut buffer = Zeroizing::new(Vec::new());
    let limit = u64::try_from(MAX_CREDENTIAL_BYTES).unwrap_or(u64::MAX);
    input
        .take(limit.saturating_add(1))
        .read_to_end(&mut buffer)
        .map_err(|err| CliError::new(format!("cannot read credential from stdin: {err}")))?;
    if buffer.len() > MAX_CREDENTIAL_BYTES {
        return Err(CliError::new(format!(
            "credential exceeds size limit ({MAX_CREDENTIAL_BYTES} bytes)"
        )));
    }
    if serde_json::from_slice::<BTreeMap<String, IgnoredAny>>(&buffer).is_err() {
        return Err(CliError::new("credential must be a JSON object".to_string()));
    }
    Ok(Secret::new(std::mem::take(&mut *buffer)))
}

/// Checks `secret` carries the fields the connector type requires.
fn validate_credential_for_type(
    registry: &ConnectorRegistry,
    connector_type: &str,
    secret: &Secret,
) -> CliResult<()> {
    let outcome = if let Ok(factory) = registry.resolve_source(connector_type) {
        factory.validate_credential(secret)
    } else if let Ok(factory) = registry.resolve_sink(connector_type) {
        factory.validate_credential(secret)
    } else {
        return Err(CliError::new(format!("unknown connector type: {connector_type}")));
    };
    outcome.map_err(|err| CliError::new(format!("invalid {connector_type} credential: {err}")))
}

// ============================================================================
// SECTION: Register Command
// ============================================================================

/// Executes `register source` and `register sink`.
fn command_register(config: &LochnessConfig, command: &RegisterCommand) -> CliResult<ExitCode> {
    let registry = build_registry(config)?;
    let store = open_store(config)?;
    match command {
        RegisterCommand::Source(args) => {
            let instance: DataSourceInstance = read_registration(&args.file)?;
            register_source(&registry, &store, &instance)?;
            write_json_line(&Registered {
                kind: "source",
                id: instance.id.as_str(),
                connector_type: instance.connector.connector_type().as_str(),
            })?;
        }
        RegisterCommand::Sink(args) => {
            let instance: DataSinkInstance = read_registration(&args.file)?;
            register_sink(&registry, &store, &instance)?;
            write_json_line(&Registered {
                kind: "sink",
                id: instance.id.as_str(),
                connector_type: instance.connector.connector_type().as_str(),
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Records the source type descriptor and creates the instance.
fn register_source(
    registry: &ConnectorRegistry,
    catalog: &dyn CatalogStore,
    instance: &DataSourceInstance,
) -> CliResult<()> {
    let connector_type = instance.connector.connector_type();
    let factory =
        registry.resolve_source(connector_type.as_str()).map_err(|err| CliError::new(err.to_string()))?;
    factory.build(instance).map_err(|err| CliError::new(format!("invalid source instance: {err}")))?;
    catalog.register_source_type(&factory.descriptor()).map_err(|err| CliError::new(err.to_string()))?;
    catalog.create_source_instance(instance).map_err(|err| CliError::new(err.to_string()))
}

/// Records the sink type descriptor and creates the instance.
fn register_sink(
    registry: &ConnectorRegistry,
    catalog: &dyn CatalogStore,
    instance: &DataSinkInstance,
) -> CliResult<()> {
    let connector_type = instance.connector.connector_type();
    let factory =
        registry.resolve_sink(connector_type.as_str()).map_err(|err| CliError::new(err.to_string()))?;
    factory.build(instance).map_err(|err| CliError::new(format!("invalid sink instance: {err}")))?;
    catalog.register_sink_type(&factory.descriptor()).map_err(|err| CliError::new(err.to_string()))?;
    catalog.create_sink_instance(instance).map_err(|err| CliError::new(err.to_string()))
}

/// Reads and decodes a registration document.
fn read_registration<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let bytes = read_bytes_with_limit(path, MAX_REGISTRATION_BYTES)
        .map_err(|err| CliError::new(format!("cannot read {}: {err}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| CliError::new(format!("invalid registration document {}: {err}", path.display())))
}

/// Reads a file from disk while enforcing a hard size limit.
fn read_bytes_with_limit(path: &Path, max_bytes: usize) -> Result<Vec<u8>, ReadLimitError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    if size > limit {
        return Err(ReadLimitError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let mut bytes = Vec::new();
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(ReadLimitError::TooLarge {
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

// ============================================================================
// SECTION: Output
// ============================================================================

/// Writes one JSON document followed by a newline to stdout.
fn write_json_line<T: Serialize>(value: &T) -> CliResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|err| CliError::new(format!("cannot serialize output: {err}")))?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").map_err(|err| CliError::new(format!("cannot write to stdout: {err}")))
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(&format!("error: {message}"));
    ExitCode::FAILURE
}
