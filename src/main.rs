use anyhow::Result;
use axum::Router;
use object_meta::{
    config::AppConfig,
    handlers::AppState,
    routes,
    services::{
        backend::{BackendStore, FsBackend},
        maintenance::MaintenanceWorker,
        metadata_service::MetadataService,
        schema::run_migrations,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-meta with config: {:?}", cfg);

    // --- Ensure backend directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx does not create the file on its own
    match fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(db_path)
    {
        Ok(_) => tracing::debug!("Database file can be created/opened."),
        Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
    }

    let connect_options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        // writers wait for the lock instead of failing with SQLITE_BUSY
        .busy_timeout(Duration::from_secs(5));
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?,
    );

    // --- Schema ---
    run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize engine, backend and worker ---
    let metadata = MetadataService::new(db.clone(), cfg.metadata.clone());
    let backend: Arc<dyn BackendStore> = Arc::new(FsBackend::new(&cfg.storage_dir));
    let worker = MaintenanceWorker::new(
        metadata.clone(),
        backend.clone(),
        Duration::from_secs(cfg.maintenance_interval_secs.max(1)),
    );
    let _maintenance = if cfg.maintenance_interval_secs > 0 {
        Some(worker.clone().spawn())
    } else {
        tracing::info!("Periodic maintenance disabled");
        None
    };

    // --- Build router ---
    let state = AppState {
        metadata,
        backend,
        worker,
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
