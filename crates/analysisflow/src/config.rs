use std::time::Duration;

// Headroom over the job timeout for the worker's own store-write backoff.
const STALE_MARGIN_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DurableBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FastQueueBackend {
    Redis,
    Memory,
}

// Config is a central place for runtime configuration.
// Values come from the environment (and a .env file when present).
#[derive(Clone, Debug)]
pub struct Config {
    pub durable_backend: DurableBackend,
    pub database_url: Option<String>,
    pub fast_backend: FastQueueBackend,
    pub redis_url: String,

    pub queue: String,
    pub job_timeout_secs: u64,
    pub result_ttl_secs: u64,
    pub max_retries: u32,

    pub worker_id: String,
    pub worker_concurrency: usize,
    pub stale_after_secs: u64,
    pub recovery_interval_secs: u64,
    pub delete_documents: bool,
    pub analyzer_cmd: Option<String>,

    pub api_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let durable_backend = match env_or_fallback("AF_DURABLE_STORE", "DURABLE_STORE")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            None | Some("postgres") | Some("pg") => DurableBackend::Postgres,
            Some("memory") => DurableBackend::Memory,
            Some(other) => anyhow::bail!("unknown AF_DURABLE_STORE: {other}"),
        };

        let fast_backend = match env_or_fallback("AF_FAST_QUEUE", "FAST_QUEUE")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            None | Some("redis") => FastQueueBackend::Redis,
            Some("memory") => FastQueueBackend::Memory,
            Some(other) => anyhow::bail!("unknown AF_FAST_QUEUE: {other}"),
        };

        let database_url = env_or_fallback("AF_DATABASE_URL", "DATABASE_URL");
        if durable_backend == DurableBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is missing");
        }

        let redis_url = env_or_fallback("AF_REDIS_URL", "REDIS_URL").unwrap_or_else(|| {
            redis_url_from_parts(
                &env_string("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                env_parse("REDIS_PORT").unwrap_or(6379),
                env_parse("REDIS_DB").unwrap_or(0),
                env_string("REDIS_PASSWORD").as_deref(),
            )
        });

        let queue = env_or_fallback("AF_QUEUE", "QUEUE")
            .unwrap_or_else(|| "document_analysis".to_string());

        let job_timeout_secs: u64 = env_parse("AF_JOB_TIMEOUT_SECS").unwrap_or(300).max(1);
        let result_ttl_secs: u64 = env_parse("AF_RESULT_TTL_SECS").unwrap_or(86_400).max(1);
        let max_retries: u32 = env_parse("AF_MAX_RETRIES").unwrap_or(3);

        let worker_id = env_or_fallback("AF_WORKER_ID", "WORKER_ID")
            .or_else(|| env_string("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let worker_concurrency = env_parse("AF_WORKER_CONCURRENCY")
            .unwrap_or(1usize)
            .clamp(1, 64);

        let stale_after_secs =
            stale_after_floor(job_timeout_secs, env_parse("AF_STALE_AFTER_SECS"));
        let recovery_interval_secs: u64 = env_parse("AF_RECOVERY_INTERVAL_SECS")
            .unwrap_or(60)
            .max(1);

        let delete_documents = env_bool("AF_DELETE_DOCUMENTS").unwrap_or(false);
        let analyzer_cmd = env_string("AF_ANALYZER_CMD");

        let api_addr = env_or_fallback("AF_API_ADDR", "API_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("AF_MIGRATE_ON_STARTUP").unwrap_or(false);
        let log_json = env_bool("AF_LOG_JSON").unwrap_or(false);

        Ok(Self {
            durable_backend,
            database_url,
            fast_backend,
            redis_url,
            queue,
            job_timeout_secs,
            result_ttl_secs,
            max_retries,
            worker_id,
            worker_concurrency,
            stale_after_secs,
            recovery_interval_secs,
            delete_documents,
            analyzer_cmd,
            api_addr,
            migrate_on_startup,
            log_json,
        })
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

/// Recovery must never reclaim a job that may still be running, so the
/// threshold is kept above the job timeout plus write backoff.
pub fn stale_after_floor(job_timeout_secs: u64, requested: Option<u64>) -> u64 {
    let floor = job_timeout_secs.saturating_add(STALE_MARGIN_SECS);
    requested
        .unwrap_or_else(|| job_timeout_secs.saturating_mul(2))
        .max(floor)
}

pub fn redis_url_from_parts(host: &str, port: u16, db: u32, password: Option<&str>) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(pw) => format!("redis://:{pw}@{host}:{port}/{db}"),
        None => format!("redis://{host}:{port}/{db}"),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    env_string(primary).or_else(|| env_string(fallback))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

pub fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
