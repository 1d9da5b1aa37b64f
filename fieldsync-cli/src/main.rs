use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldsync_core::keystore::{FileKeyProvider, KeyProvider, MasterKeyGuardian, OsKeyringProvider};
use fieldsync_core::records::{RecordKind, RecordState, SqliteRecordStore};
use fieldsync_core::sync::{
    AlwaysOnline, Constraints, ExistingWorkPolicy, HttpTransport, InfoSyncJob, JobState,
    SyncOrchestrator, SyncScheduler, INFO_SYNC_WORK_NAME,
};
use fieldsync_core::vault::{SettingsVault, VaultLayout};
use fieldsync_core::{
    ensure_dir, FieldSyncConfig, LoginCoordinator, LoginOutcome, LoginRequest, LoginService,
    LoginSubmit,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// FieldSync CLI - offline-first field data capture with encrypted local state
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first field data capture client", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Keep the master key in a file instead of the OS keyring
    #[arg(long, global = true)]
    no_keyring: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the master key and the encrypted settings vault
    Init,

    /// Log in to the server, or re-authenticate offline
    Login {
        #[arg(long)]
        username: String,

        /// Check against the stored credentials without contacting the server
        #[arg(long)]
        offline: bool,
    },

    /// Clear the session and the stored credentials
    Logout,

    /// Show vault, session and record status
    Status,

    /// Manage locally captured records
    Record {
        #[command(subcommand)]
        action: RecordCommand,
    },

    /// Upload pending records
    Sync,

    /// Refresh reference data
    InfoSync,

    /// Add a new primary key to the vault keyset
    RotateKeyset,
}

#[derive(Subcommand)]
enum RecordCommand {
    /// Capture a new record
    Add {
        /// training_form, facility_bp_info or usage_telemetry
        #[arg(long)]
        kind: RecordKind,

        /// Record payload as JSON
        #[arg(long)]
        payload: String,

        /// Keep out of sync until un-marked
        #[arg(long)]
        draft: bool,
    },

    /// List records
    List {
        #[arg(long)]
        kind: Option<RecordKind>,
    },

    /// Replace a record's payload
    Edit {
        id: i64,

        #[arg(long)]
        payload: String,
    },

    /// Delete a record that has not been uploaded
    Delete { id: i64 },

    /// Mark or un-mark a record as draft
    Draft {
        id: i64,

        /// Un-mark instead
        #[arg(long)]
        off: bool,
    },
}

/// Everything opened from the config for one command
struct Client {
    config: FieldSyncConfig,
    guardian: Arc<MasterKeyGuardian>,
    layout: VaultLayout,
}

impl Client {
    fn new(config: FieldSyncConfig, no_keyring: bool) -> Result<Self> {
        let data_dir = ensure_dir(&config.storage.data_dir())
            .with_context(|| format!("Failed to create data directory {:?}", config.storage.data_dir()))?;

        let hardware: Option<Arc<dyn KeyProvider>> = if config.keystore.prefer_hardware && !no_keyring {
            Some(Arc::new(OsKeyringProvider::new("FieldSync")))
        } else {
            None
        };
        let software: Arc<dyn KeyProvider> = Arc::new(FileKeyProvider::new(data_dir.join("keys")));
        let guardian = MasterKeyGuardian::new(config.keystore.alias.clone(), hardware, software)
            .with_retry_policies(config.keystore.lookup_retry(), config.keystore.operation_retry());

        Ok(Self {
            layout: config.storage.vault_layout(),
            guardian: Arc::new(guardian),
            config,
        })
    }

    async fn vault(&self) -> Result<Arc<SettingsVault>> {
        if !SettingsVault::is_initialized(&self.layout) {
            bail!("No vault found. Please create one with: fieldsync init");
        }
        let vault = SettingsVault::open(self.guardian.clone(), self.layout.clone())
            .await
            .context("Failed to open settings vault")?;
        Ok(Arc::new(vault))
    }

    fn store(&self) -> Result<Arc<SqliteRecordStore>> {
        let path = self.config.storage.records_path();
        let store = SqliteRecordStore::open(&path)
            .with_context(|| format!("Failed to open record store {:?}", path))?;
        Ok(Arc::new(store))
    }

    fn transport(&self) -> Result<Arc<HttpTransport>> {
        let transport = HttpTransport::new(&self.config.server.base_url, self.config.server.timeout())
            .context("Failed to create HTTP transport")?;
        Ok(Arc::new(transport))
    }

    fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(Arc::new(AlwaysOnline), self.config.sync.scheduler_settings())
    }
}

fn parse_payload(payload: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    if !value.is_object() {
        bail!("Payload must be a JSON object");
    }
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting default subscriber failed")?;

    let config = FieldSyncConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    let client = Client::new(config, cli.no_keyring)?;

    match cli.command {
        Commands::Init => init(&client).await,
        Commands::Login { username, offline } => login(&client, &username, offline).await,
        Commands::Logout => {
            client.vault().await?.logout().await?;
            println!("Logged out");
            Ok(())
        }
        Commands::Status => status(&client).await,
        Commands::Record { action } => record(&client, action),
        Commands::Sync => sync(&client).await,
        Commands::InfoSync => info_sync(&client).await,
        Commands::RotateKeyset => {
            let key_id = client.vault().await?.rotate_keyset().await?;
            println!("Keyset rotated; new primary key id {}", key_id);
            Ok(())
        }
    }
}

async fn init(client: &Client) -> Result<()> {
    info!("FieldSync v{}", VERSION);
    let created = SettingsVault::bootstrap(&client.guardian, &client.layout)
        .await
        .context("Failed to initialize vault")?;
    if created {
        let backing = client
            .guardian
            .provider_kind()
            .map(|k| format!("{:?}", k).to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        println!("Vault created at {:?} ({} key)", client.layout.meta_path, backing);
    } else {
        println!("Vault already initialized at {:?}", client.layout.meta_path);
    }
    Ok(())
}

async fn login(client: &Client, username: &str, offline: bool) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    let service = LoginService::new(
        client.transport()?,
        client.vault().await?,
        client.config.hashing.hasher(),
    );
    let coordinator = LoginCoordinator::spawn(Arc::new(service));
    let mut outcomes = coordinator.subscribe();

    let request = if offline {
        LoginRequest::offline(username, &password)
    } else {
        LoginRequest::online(username, &password)
    };
    drop(password);
    if coordinator.submit(request)? == LoginSubmit::Coalesced {
        bail!("A login is already in progress");
    }

    loop {
        outcomes.changed().await.map_err(|_| anyhow!("Login worker stopped"))?;
        let outcome = outcomes.borrow_and_update().clone();
        match outcome {
            LoginOutcome::Idle | LoginOutcome::InProgress => continue,
            LoginOutcome::LoggedIn { at } => {
                println!("Logged in at {}", at.to_rfc3339());
                return Ok(());
            }
            LoginOutcome::Reauthenticated { at } => {
                println!("Re-authenticated offline at {}", at.to_rfc3339());
                return Ok(());
            }
            LoginOutcome::LoggedOut => return Ok(()),
            LoginOutcome::Failed(reason) => bail!("Login failed: {}", reason),
        }
    }
}

async fn status(client: &Client) -> Result<()> {
    let vault = client.vault().await?;
    let status = vault.status().await;
    let settings = vault.read().await?;

    println!("Install id:      {}", status.install_id);
    println!("Vault created:   {}", status.created_at.to_rfc3339());
    println!("Primary key id:  {}", status.primary_key_id);
    let session = match &settings.token {
        Some(token) if token.is_expired(chrono::Utc::now()) => "expired",
        Some(_) => "active",
        None => "none",
    };
    println!("Session:         {}", session);
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    };
    println!("Last login:      {}", fmt_time(settings.last_auth_at));
    println!("Last synced:     {}", fmt_time(settings.last_synced_at));

    let records = client.store()?.list(None)?;
    for state in [
        RecordState::Draft,
        RecordState::ReadyForUpload,
        RecordState::Partial,
        RecordState::Uploaded,
    ] {
        let count = records.iter().filter(|r| r.state() == state).count();
        println!("{:<17}{}", format!("{}:", state), count);
    }
    Ok(())
}

fn record(client: &Client, action: RecordCommand) -> Result<()> {
    let store = client.store()?;
    match action {
        RecordCommand::Add { kind, payload, draft } => {
            let record = store.create(kind, &parse_payload(&payload)?, draft)?;
            println!("Created {} record {}", record.kind, record.id);
        }
        RecordCommand::List { kind } => {
            let records = store.list(kind)?;
            if records.is_empty() {
                println!("No records");
            }
            for r in records {
                let error = r
                    .server_error_message
                    .as_deref()
                    .map(|m| format!("  error: {}", m))
                    .unwrap_or_default();
                println!(
                    "{:>5}  {:<18} {:<16} {}{}",
                    r.id,
                    r.kind.as_str(),
                    r.state().to_string(),
                    r.modified_at.format("%Y-%m-%d %H:%M"),
                    error
                );
            }
        }
        RecordCommand::Edit { id, payload } => {
            store.edit_payload(id, &parse_payload(&payload)?)?;
            println!("Updated record {}", id);
        }
        RecordCommand::Delete { id } => {
            store.delete(id)?;
            println!("Deleted record {}", id);
        }
        RecordCommand::Draft { id, off } => {
            let record = store.set_draft(id, !off)?;
            println!("Record {} is now {}", id, record.state());
        }
    }
    Ok(())
}

/// Wait for a scheduled job, printing progress and cancelling on Ctrl+C
async fn follow(mut handle: fieldsync_core::sync::JobHandle) -> Result<JobState> {
    let mut progress = handle.progress();
    let cancel = handle.clone();
    loop {
        tokio::select! {
            state = handle.wait() => return Ok(state),
            changed = progress.changed() => {
                if changed.is_err() {
                    continue;
                }
                let p = progress.borrow_and_update().clone();
                match (p.counts, p.info_stage) {
                    (Some(c), _) => println!("{}: {}/{} ({} failed)", p.stage, c.done, c.total, c.failed),
                    (None, Some(sub)) => println!("{}: {}", p.stage, sub),
                    (None, None) => println!("{}", p.stage),
                }
            }
            _ = signal::ctrl_c() => {
                warn!("Interrupted; stopping after the current record");
                cancel.cancel();
            }
        }
    }
}

async fn sync(client: &Client) -> Result<()> {
    let store = client.store()?;
    let orchestrator = SyncOrchestrator::new(store.clone(), client.transport()?, client.vault().await?);
    let scheduler = client.scheduler();
    let handle = scheduler.enqueue_unique(
        &client.config.sync.work_name,
        ExistingWorkPolicy::Keep,
        Constraints::network(),
        Arc::new(orchestrator),
    )?;

    match follow(handle).await? {
        JobState::Succeeded => {
            let failed: Vec<_> = store
                .list(None)?
                .into_iter()
                .filter(|r| r.server_error_message.is_some())
                .collect();
            for r in &failed {
                println!(
                    "Record {} rejected: {}",
                    r.id,
                    r.server_error_message.as_deref().unwrap_or_default()
                );
            }
            println!("Sync complete; {} record(s) need attention", failed.len());
            Ok(())
        }
        JobState::Cancelled => bail!("Sync cancelled"),
        JobState::Failed(reason) => bail!("Sync failed: {}", reason),
        other => bail!("Sync ended in unexpected state {:?}", other),
    }
}

async fn info_sync(client: &Client) -> Result<()> {
    let store = client.store()?;
    let job = InfoSyncJob::new(client.transport()?, store, client.vault().await?);
    let scheduler = client.scheduler();
    let handle = scheduler.enqueue_unique(
        INFO_SYNC_WORK_NAME,
        ExistingWorkPolicy::Replace,
        Constraints::network(),
        Arc::new(job),
    )?;

    match follow(handle).await? {
        JobState::Succeeded => {
            println!("Reference data refreshed");
            Ok(())
        }
        JobState::Cancelled => bail!("Reference data refresh cancelled"),
        JobState::Failed(reason) => bail!("Reference data refresh failed: {}", reason),
        other => bail!("Reference data refresh ended in unexpected state {:?}", other),
    }
}
