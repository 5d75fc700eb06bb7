use std::{str::FromStr, sync::Arc};

use anyhow::Context;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use crate::store::{
    JobStore, MemoryJobStore, MemoryUsageStore, SqliteJobStore, SqliteUsageStore, UsageStore,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// `database_url` value that selects the process-local stores.
pub const MEMORY_URL: &str = "memory";

pub async fn create_pool(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true);

    // Every connection to `sqlite::memory:` opens a separate database.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };

    Ok(pool.connect_with(options).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub usage: Arc<dyn UsageStore>,
}

pub async fn open_stores(url: &str) -> anyhow::Result<Stores> {
    if url == MEMORY_URL {
        info!("using in-memory stores; scan history will not survive a restart");
        return Ok(Stores {
            jobs: Arc::new(MemoryJobStore::new()),
            usage: Arc::new(MemoryUsageStore::new()),
        });
    }

    let pool = create_pool(url).await?;
    run_migrations(&pool).await?;
    Ok(Stores {
        jobs: Arc::new(SqliteJobStore::new(pool.clone())),
        usage: Arc::new(SqliteUsageStore::new(pool)),
    })
}
