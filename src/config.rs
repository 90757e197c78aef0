use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GateError;

const ENV_PREFIX: &str = "CMDGATE_";

/// Uniform resource limits applied to every sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub open_files: u64,
    /// Largest file a process may write when its template allows writes.
    pub max_file_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 60,
            memory_bytes: 512 * 1024 * 1024,
            open_files: 64,
            max_file_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Runtime settings. Read from `CMDGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub templates_path: PathBuf,
    pub callers_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_output_bytes: usize,
    pub cancel_grace: Duration,
    pub limits: ResourceLimits,
    /// Fail jobs whose isolation cannot be established instead of running them anyway.
    pub strict_isolation: bool,
    pub sandbox_path: String,
    pub workdir: PathBuf,
    pub log_filter: String,
    pub log_format: LogFormat,
    /// How long a finished job stays queryable.
    pub job_ttl: Duration,
    pub max_finished_jobs: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            templates_path: PathBuf::from("config/templates.toml"),
            callers_path: PathBuf::from("config/callers.toml"),
            audit_log_path: PathBuf::from("audit.ndjson"),
            workers: 4,
            queue_capacity: 100,
            max_output_bytes: 1024 * 1024,
            cancel_grace: Duration::from_millis(5000),
            limits: ResourceLimits::default(),
            strict_isolation: true,
            sandbox_path: "/usr/local/bin:/usr/bin:/bin".to_owned(),
            workdir: std::env::temp_dir(),
            log_filter: "info".to_owned(),
            log_format: LogFormat::Text,
            job_ttl: Duration::from_secs(3600),
            max_finished_jobs: 1000,
        }
    }
}

impl Settings {
    /// Load settings from the process environment, after applying `.env` if present.
    pub fn from_env() -> Result<Self, GateError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Keys are full names (`CMDGATE_WORKERS`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GateError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut settings = Self::default();

        if let Some(v) = var("TEMPLATES") {
            settings.templates_path = PathBuf::from(v);
        }
        if let Some(v) = var("CALLERS") {
            settings.callers_path = PathBuf::from(v);
        }
        if let Some(v) = var("AUDIT_LOG") {
            settings.audit_log_path = PathBuf::from(v);
        }
        if let Some(v) = var("WORKERS") {
            settings.workers = parse_positive("WORKERS", &v)?;
        }
        if let Some(v) = var("QUEUE_CAPACITY") {
            settings.queue_capacity = parse_positive("QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = var("MAX_OUTPUT_BYTES") {
            settings.max_output_bytes = parse_positive("MAX_OUTPUT_BYTES", &v)?;
        }
        if let Some(v) = var("CANCEL_GRACE_MS") {
            settings.cancel_grace = Duration::from_millis(parse("CANCEL_GRACE_MS", &v)?);
        }
        if let Some(v) = var("CPU_SECONDS") {
            settings.limits.cpu_seconds = parse_positive("CPU_SECONDS", &v)?;
        }
        if let Some(v) = var("MEMORY_BYTES") {
            settings.limits.memory_bytes = parse_positive("MEMORY_BYTES", &v)?;
        }
        if let Some(v) = var("OPEN_FILES") {
            settings.limits.open_files = parse_positive("OPEN_FILES", &v)?;
        }
        if let Some(v) = var("MAX_FILE_BYTES") {
            settings.limits.max_file_bytes = parse("MAX_FILE_BYTES", &v)?;
        }
        if let Some(v) = var("STRICT_ISOLATION") {
            settings.strict_isolation = parse_bool("STRICT_ISOLATION", &v)?;
        }
        if let Some(v) = var("SANDBOX_PATH") {
            settings.sandbox_path = v;
        }
        if let Some(v) = var("WORKDIR") {
            settings.workdir = PathBuf::from(v);
        }
        if let Some(v) = var("JOB_TTL_SECS") {
            settings.job_ttl = Duration::from_secs(parse_positive("JOB_TTL_SECS", &v)?);
        }
        if let Some(v) = var("MAX_FINISHED_JOBS") {
            settings.max_finished_jobs = parse_positive("MAX_FINISHED_JOBS", &v)?;
        }
        if let Some(v) = var("LOG_FILTER") {
            settings.log_filter = v;
        }
        if let Some(v) = var("LOG_FORMAT") {
            settings.log_format = match v.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(GateError::Settings(format!(
                        "{ENV_PREFIX}LOG_FORMAT must be 'text' or 'json', got '{other}'"
                    )));
                }
            };
        }

        Ok(settings)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, GateError> {
    value
        .trim()
        .parse()
        .map_err(|_| GateError::Settings(format!("{ENV_PREFIX}{name}: cannot parse '{value}'")))
}

fn parse_positive<T: FromStr + PartialEq + Default>(name: &str, value: &str) -> Result<T, GateError> {
    let parsed: T = parse(name, value)?;
    if parsed == T::default() {
        return Err(GateError::Settings(format!(
            "{ENV_PREFIX}{name} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_bool(name: &str, value: &str) -> Result<bool, GateError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GateError::Settings(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got '{value}'"
        ))),
    }
}
