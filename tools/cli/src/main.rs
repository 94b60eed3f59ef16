//! CloudShelf CLI - offload host attachments to Google Drive.
//!
//! This tool runs the file proxy, triggers sync and reconciliation runs,
//! and walks an operator through the OAuth handshake.

mod config;
mod credentials;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cloudshelf_common::{BackoffExecutor, Credential, FileId};
use cloudshelf_host::{AdapterRegistry, AllowListAcl, FilestoreAdapter, SqliteStore};
use cloudshelf_proxy::{AppState, DiskCache, FileProxy, HostContentSource};
use cloudshelf_remote::gdrive::{DriveClient, GoogleOAuth};
use cloudshelf_remote::{RemoteStore, TokenManager};
use cloudshelf_sync::{
    ReconcileReport, Schedule, SessionReport, SyncContext, SyncEngine, SyncSummary,
    DEFAULT_BATCH_SIZE, DEFAULT_MANUAL_LIMIT,
};

use crate::config::AppConfig;
use crate::credentials::JsonCredentialStore;

#[derive(Parser)]
#[command(name = "cloudshelf")]
#[command(about = "CloudShelf - Attachment offload to Google Drive")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve files over HTTP and run the periodic scheduler.
    Serve,

    /// Sync a bounded batch of local attachments.
    Sync {
        /// Maximum number of files to process.
        #[arg(short, long, default_value_t = DEFAULT_MANUAL_LIMIT)]
        limit: usize,
    },

    /// Sync every eligible attachment, batch by batch.
    SyncAll {
        /// Files per batch.
        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Sync a single attachment.
    SyncFile {
        /// Attachment ID.
        id: i64,
    },

    /// Run automatic syncs and reconciliation until interrupted.
    Auto,

    /// Repair drift between host records and the remote store.
    Reconcile {
        /// Maximum number of files to check.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Authorize the Google Drive credential.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Inspect or refresh the access token.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Manage the download cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Add a local file to the host file store.
    Import {
        /// Entity type the attachment belongs to.
        entity_type: String,

        /// Record the attachment belongs to.
        entity_id: i64,

        /// File to import.
        path: PathBuf,

        /// MIME type (default: guessed by the remote store).
        #[arg(long)]
        mime_type: Option<String>,
    },

    /// Write an example configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Print the consent URL.
    Url {
        /// Also open it in the default browser.
        #[arg(long)]
        open: bool,
    },

    /// Finish authorization with the code from the redirect.
    Complete {
        /// Authorization code.
        #[arg(long)]
        code: String,

        /// State parameter from the redirect.
        #[arg(long)]
        state: String,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Show the credential state and token lifetime.
    Status,
    /// Refresh the access token now.
    Refresh,
    /// Call the remote store with the current token.
    Test,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete every cached blob.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Commands::Init { force } => cmd_init(&config_path, force),
        Commands::Cache {
            action: CacheAction::Clear,
        } => cmd_cache_clear(&AppConfig::load(&config_path)?).await,
        command => {
            let config = AppConfig::load(&config_path)?;
            let runtime = Runtime::build(config).await?;
            runtime.dispatch(command).await
        }
    }
}

/// Everything a command needs, wired from the configuration.
struct Runtime {
    config: AppConfig,
    store: Arc<SqliteStore>,
    filestores: HashMap<String, Arc<FilestoreAdapter>>,
    registry: Arc<AdapterRegistry>,
    tokens: Arc<TokenManager>,
    remote: Arc<dyn RemoteStore>,
    backoff: BackoffExecutor,
}

impl Runtime {
    async fn build(config: AppConfig) -> Result<Self> {
        let paths = &config.paths;
        if let Some(parent) = paths.database.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = Arc::new(
            SqliteStore::open(&paths.database)
                .with_context(|| format!("Failed to open {}", paths.database.display()))?,
        );

        let mut registry = AdapterRegistry::new();
        let mut filestores = HashMap::new();
        for entity_type in config.entity_types() {
            let adapter = Arc::new(
                FilestoreAdapter::new(&entity_type, &paths.filestore, store.clone())
                    .context("Failed to prepare file store")?,
            );
            registry.register(adapter.clone())?;
            filestores.insert(entity_type, adapter);
        }

        let backoff = BackoffExecutor::new(config.retry.to_backoff());
        let credential_store = JsonCredentialStore::new(&paths.credential_file);
        let credential = match credential_store.load().await? {
            Some(credential) => credential,
            None => {
                if config.oauth.client_id.is_empty() {
                    warn!("No OAuth client configured; remote calls will fail");
                }
                Credential::new(
                    &config.sync.credential_ref,
                    &config.oauth.client_id,
                    &config.oauth.client_secret,
                )
            }
        };
        let tokens = TokenManager::new(
            credential,
            Arc::new(GoogleOAuth::new().context("Failed to create OAuth client")?),
            backoff.clone(),
        )
        .with_store(Arc::new(credential_store));

        let remote: Arc<dyn RemoteStore> =
            Arc::new(DriveClient::new().context("Failed to create Drive client")?);

        Ok(Self {
            config,
            store,
            filestores,
            registry: Arc::new(registry),
            tokens: Arc::new(tokens),
            remote,
            backoff,
        })
    }

    fn engine(&self) -> Result<Arc<SyncEngine>> {
        let ctx = SyncContext {
            tokens: self.tokens.clone(),
            remote: self.remote.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            audit: self.store.clone(),
            backoff: self.backoff.clone(),
        };
        let engine = SyncEngine::new(
            ctx,
            self.config.sync.clone(),
            self.config.models.clone(),
            &self.config.effective_file_types(),
            self.config.reconcile.clone(),
        )?;
        Ok(Arc::new(engine))
    }

    async fn proxy(&self) -> Result<Arc<FileProxy>> {
        let cache = DiskCache::from_config(&self.config.paths.cache_dir, &self.config.cache)
            .await
            .context("Failed to open cache directory")?;
        let content = HostContentSource::new(
            self.tokens.clone(),
            self.remote.clone(),
            self.registry.clone(),
            self.backoff.clone(),
        );
        Ok(Arc::new(FileProxy::new(
            self.store.clone(),
            Arc::new(AllowListAcl::from_rules(&self.config.access)),
            self.store.clone(),
            Arc::new(content),
            Arc::new(cache),
        )))
    }

    fn schedule(&self) -> Schedule {
        let every = self.config.schedule.reconcile_every_secs;
        Schedule {
            automatic_every: Some(self.config.sync.sync_frequency()),
            reconcile_every: (every > 0).then_some(Duration::from_secs(every)),
            reconcile_limit: self.config.schedule.reconcile_limit,
        }
    }

    async fn dispatch(self, command: Commands) -> Result<()> {
        match command {
            Commands::Serve => self.cmd_serve().await,
            Commands::Sync { limit } => self.cmd_sync(limit).await,
            Commands::SyncAll { batch_size } => self.cmd_sync_all(batch_size).await,
            Commands::SyncFile { id } => self.cmd_sync_file(id).await,
            Commands::Auto => self.cmd_auto().await,
            Commands::Reconcile { limit } => self.cmd_reconcile(limit).await,
            Commands::Auth { action } => self.cmd_auth(action).await,
            Commands::Token { action } => self.cmd_token(action).await,
            Commands::Import {
                entity_type,
                entity_id,
                path,
                mime_type,
            } => {
                self.cmd_import(&entity_type, entity_id, &path, mime_type.as_deref())
                    .await
            }
            Commands::Init { .. } | Commands::Cache { .. } => {
                anyhow::bail!("command does not use the runtime")
            }
        }
    }

    /// Run the HTTP server and the scheduler until Ctrl-C.
    async fn cmd_serve(&self) -> Result<()> {
        let proxy = self.proxy().await?;
        let engine = self.engine()?;
        let (scheduler, scheduler_task) = engine.start_scheduler(self.schedule());

        let cache = proxy.cache().clone();
        let purge_every = self
            .config
            .cache
            .ttl()
            .clamp(Duration::from_secs(60), Duration::from_secs(3600));
        let purge_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(purge_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    info!("Purged {} expired cache entries", purged);
                }
            }
        });

        let listener = TcpListener::bind(&self.config.server.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.server.bind))?;
        println!("Serving on http://{}", listener.local_addr()?);
        println!("OAuth redirect URI: {}", self.config.server.redirect_uri());

        let state = AppState {
            proxy,
            tokens: self.tokens.clone(),
        };
        let served = cloudshelf_proxy::serve(listener, state, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await;

        purge_task.abort();
        scheduler.shutdown().await;
        let _ = scheduler_task.await;

        served.context("HTTP server failed")
    }

    async fn cmd_sync(&self, limit: usize) -> Result<()> {
        let summary = self
            .engine()?
            .orchestrator()
            .manual_sync(Some(limit))
            .await
            .context("Sync failed")?;
        print_summary(&summary);
        Ok(())
    }

    async fn cmd_sync_all(&self, batch_size: usize) -> Result<()> {
        let report = self
            .engine()?
            .orchestrator()
            .complete_sync(batch_size)
            .await
            .context("Complete sync failed")?;
        print_session(&report);
        Ok(())
    }

    async fn cmd_sync_file(&self, id: i64) -> Result<()> {
        let summary = self
            .engine()?
            .orchestrator()
            .sync_file(FileId(id))
            .await
            .with_context(|| format!("Failed to sync file {}", id))?;
        print_summary(&summary);
        Ok(())
    }

    async fn cmd_auto(&self) -> Result<()> {
        if !(self.config.sync.is_active && self.config.sync.auto_sync) {
            warn!("auto_sync is off; only reconciliation will run");
        }

        let engine = self.engine()?;
        let schedule = self.schedule();
        info!(
            "Automatic sync every {:?}, reconcile every {:?}",
            schedule.automatic_every, schedule.reconcile_every
        );
        let (scheduler, task) = engine.start_scheduler(schedule);

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Stopping scheduler");
        scheduler.shutdown().await;
        task.await.context("Scheduler task failed")?;
        Ok(())
    }

    async fn cmd_reconcile(&self, limit: Option<usize>) -> Result<()> {
        let limit = limit.unwrap_or(self.config.schedule.reconcile_limit);
        let report = self
            .engine()?
            .reconciler()
            .reconcile(limit)
            .await
            .context("Reconciliation failed")?;
        print_reconcile(&report);
        Ok(())
    }

    async fn cmd_auth(&self, action: AuthAction) -> Result<()> {
        match action {
            AuthAction::Url { open } => {
                let redirect_uri = self.config.server.redirect_uri();
                let (url, nonce) = self
                    .tokens
                    .request_authorization(&redirect_uri)
                    .await
                    .context("Failed to start authorization")?;

                println!("Open this URL to grant access:");
                println!("  {}", url);
                println!("State: {}", nonce);
                if open {
                    if let Err(e) = open::that(&url) {
                        warn!("Failed to open browser: {}", e);
                    }
                }
            }
            AuthAction::Complete { code, state } => {
                self.tokens
                    .complete_authorization(&code, &state)
                    .await
                    .context("Authorization failed")?;
                println!("Credential '{}' authorized.", self.tokens.name());
            }
        }
        Ok(())
    }

    async fn cmd_token(&self, action: TokenAction) -> Result<()> {
        match action {
            TokenAction::Status => {
                let status = self.tokens.check_status().await;
                println!("Credential: {}", self.tokens.name());
                println!("  State: {}", status.state);
                if status.remaining_seconds > 0 {
                    println!("  Expires in: {}s", status.remaining_seconds);
                } else {
                    println!("  Access token expired");
                }
            }
            TokenAction::Refresh => {
                self.tokens
                    .force_refresh()
                    .await
                    .context("Token refresh failed")?;
                let status = self.tokens.check_status().await;
                println!("Token refreshed, valid for {}s", status.remaining_seconds);
            }
            TokenAction::Test => {
                let account = self
                    .tokens
                    .test_connection(self.remote.as_ref())
                    .await
                    .context("Connection test failed")?;
                println!("Connected to Google Drive");
                if let Some(name) = account.display_name {
                    println!("  Account: {}", name);
                }
                if let Some(email) = account.email {
                    println!("  Email: {}", email);
                }
            }
        }
        Ok(())
    }

    async fn cmd_import(
        &self,
        entity_type: &str,
        entity_id: i64,
        path: &Path,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let adapter = self.filestores.get(entity_type).with_context(|| {
            format!("No active model config for entity type '{}'", entity_type)
        })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Import path has no file name")?;
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let file = adapter
            .import(entity_id, name, &data, mime_type)
            .await
            .context("Failed to import file")?;

        println!("Imported {} as file {} ({} bytes)", name, file.id, data.len());
        Ok(())
    }
}

/// Write the example configuration.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::example().save(path)?;
    println!("Configuration written to {}", path.display());
    println!("Set oauth.client_id and oauth.client_secret, then run `cloudshelf auth url`.");
    Ok(())
}

/// Blobs are only reachable from the process that wrote them, so opening
/// the cache directory sweeps it.
async fn cmd_cache_clear(config: &AppConfig) -> Result<()> {
    let cache = DiskCache::from_config(&config.paths.cache_dir, &config.cache)
        .await
        .context("Failed to open cache directory")?;
    println!("Cache at {} cleared", cache.dir().display());
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("{} sync finished in {:.1?}", summary.sync_type.as_str(), summary.duration);
    println!("  Processed: {}", summary.processed);
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Errors: {}", summary.errored);
    if summary.skipped > 0 {
        println!("  Skipped: {}", summary.skipped);
    }
    println!("  Local bytes freed: {}", summary.bytes_freed);
    if let Some(reason) = &summary.aborted {
        println!("  Aborted: {}", reason);
    }
}

fn print_session(report: &SessionReport) {
    let session = &report.session;
    println!("Session {} ({:?})", session.id, session.status);
    println!("  Batches: {}", session.batches);
    print_summary(&report.summary);
}

fn print_reconcile(report: &ReconcileReport) {
    println!("Reconciliation checked {} files", report.examined);
    if report.actions.is_empty() {
        println!("  No drift found.");
    }
    for entry in &report.actions {
        println!(
            "  [{}] file {}: {}",
            entry.action.as_str(),
            entry.file_id,
            entry.detail
        );
    }
    if report.errors > 0 {
        println!("  Errors: {}", report.errors);
    }
}
