use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,

    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub db_acquire_timeout: Duration,

    pub max_batch_size: usize,
    pub max_body_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(lookup);

        let http_bind = vars.string("FACTORY_EVENTS_HTTP_BIND", "127.0.0.1:8080");

        let store_backend = match vars.optional("FACTORY_EVENTS_STORE").as_deref() {
            None => StoreBackend::Postgres,
            Some(raw) if raw.eq_ignore_ascii_case("postgres") => StoreBackend::Postgres,
            Some(raw) if raw.eq_ignore_ascii_case("memory") => StoreBackend::Memory,
            Some(other) => bail!("invalid FACTORY_EVENTS_STORE {other:?} (expected postgres or memory)"),
        };

        let database_url = vars
            .optional("FACTORY_EVENTS_DATABASE_URL")
            .or_else(|| vars.optional("DATABASE_URL"))
            .map(normalize_database_url);
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(anyhow!(
                "FACTORY_EVENTS_DATABASE_URL or DATABASE_URL is required unless FACTORY_EVENTS_STORE=memory"
            ));
        }

        let db_pool_size: u32 = vars.parsed("FACTORY_EVENTS_DB_POOL_SIZE", 10)?;
        let db_acquire_timeout =
            Duration::from_millis(vars.parsed("FACTORY_EVENTS_DB_ACQUIRE_TIMEOUT_MS", 8_000)?);

        let max_batch_size: usize = vars.parsed("FACTORY_EVENTS_MAX_BATCH_SIZE", 50_000)?;
        let max_body_bytes: usize =
            vars.parsed("FACTORY_EVENTS_MAX_BODY_BYTES", 32 * 1024 * 1024)?;

        Ok(Self {
            http_bind,
            store_backend,
            database_url,
            db_pool_size,
            db_acquire_timeout,
            max_batch_size,
            max_body_bytes,
        })
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(value) => value.parse::<T>().with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
