use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cmdgate::audit::NdjsonAuditStore;
use cmdgate::auth::{AuthorizationContext, Authorizer, StaticTokenAuthorizer};
use cmdgate::config::{LogFormat, Settings};
use cmdgate::console::{ConsoleCommand, HELP};
use cmdgate::sandbox::ProcessSandbox;
use cmdgate::template::{Registry, TemplateCatalog};
use cmdgate::{Pipeline, PipelineOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env().context("failed to read settings")?;
    init_logging(&settings);

    let registry = Registry::load(&settings.templates_path).with_context(|| {
        format!("failed to load templates from {}", settings.templates_path.display())
    })?;
    info!(templates = registry.len(), path = %settings.templates_path.display(), "templates loaded");
    let catalog = Arc::new(TemplateCatalog::new(registry));

    let authorizer = StaticTokenAuthorizer::load(&settings.callers_path).with_context(|| {
        format!("failed to load callers from {}", settings.callers_path.display())
    })?;
    let token = std::env::var("CMDGATE_TOKEN")
        .map(SecretString::from)
        .context("CMDGATE_TOKEN not set")?;
    let identity = authorizer
        .authorize(&token)
        .context("CMDGATE_TOKEN was not accepted")?;
    info!(caller = %identity.caller, scopes = identity.scopes.len(), "caller authenticated");

    let audit = NdjsonAuditStore::open(&settings.audit_log_path).with_context(|| {
        format!("failed to open audit log {}", settings.audit_log_path.display())
    })?;
    let sandbox = ProcessSandbox::new(&settings);

    let pipeline = Pipeline::new(
        catalog,
        Arc::new(audit),
        Arc::new(sandbox),
        PipelineOptions::from(&settings),
    );
    pipeline.start_workers();

    let result = console(&pipeline, &settings, &identity).await;
    pipeline.shutdown().await;
    result
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so console output stays readable.
    match settings.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn console(
    pipeline: &Pipeline,
    settings: &Settings,
    identity: &AuthorizationContext,
) -> Result<()> {
    let mut editor = DefaultEditor::new().context("failed to start line editor")?;
    println!("cmdgate console, caller '{}'. Type 'help' for commands.", identity.caller);

    loop {
        let line = match tokio::task::block_in_place(|| editor.readline("cmdgate> ")) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("failed to read input"),
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match command {
            ConsoleCommand::Templates { category } => {
                print_json(&pipeline.list_templates(category.as_deref()));
            }
            ConsoleCommand::Submit { template, params } => {
                let auth = AuthorizationContext {
                    requested_at: Utc::now(),
                    ..identity.clone()
                };
                match pipeline.submit(&template, params, &auth).await {
                    Ok(job_id) => println!("accepted job {job_id}"),
                    Err(e) => eprintln!("rejected: {e}"),
                }
            }
            ConsoleCommand::Job(job_id) => match pipeline.get_job(job_id) {
                Ok(job) => print_json(&job),
                Err(e) => eprintln!("{e}"),
            },
            ConsoleCommand::Cancel(job_id) => match pipeline.cancel(job_id).await {
                Ok(true) => println!("cancellation requested for {job_id}"),
                Ok(false) => println!("job {job_id} already finished"),
                Err(e) => eprintln!("{e}"),
            },
            ConsoleCommand::Audit(filter) => match pipeline.audit_query(&filter).await {
                Ok(records) => print_json(&records),
                Err(e) => eprintln!("{e}"),
            },
            ConsoleCommand::Reload => match pipeline.reload_templates(&settings.templates_path) {
                Ok(version) => println!("templates reloaded (version {version})"),
                Err(e) => {
                    warn!(error = %e, "template reload failed, keeping current catalog");
                    eprintln!("{e}");
                }
            },
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Quit => break,
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}
