// Warden AI Agent Governance Runtime
// Main entry point for the warden binary

use anyhow::{bail, Context};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use warden::cli::{Cli, Command};
use warden::policy::{Policy, PolicyEngine};
use warden::provider::StubProvider;
use warden::proxy::ToolProxy;
use warden::session::SessionRuntime;
use warden::spec::TaskSpec;
use warden::store::{Session, Store};
use warden::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(cli.log.as_deref().unwrap_or("info"), cli.log_json);

    tracing::info!("Warden v{}", env!("CARGO_PKG_VERSION"));

    let state_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .context("could not determine home directory; pass --state-dir")?
            .join(".warden"),
    };

    match cli.command {
        Command::Run { spec } => handle_run(&state_dir, &spec).await,
        Command::Validate { spec } => handle_validate(&spec),
    }
}

async fn handle_run(state_dir: &PathBuf, spec_path: &PathBuf) -> anyhow::Result<()> {
    // Validate before touching any state.
    let spec = TaskSpec::load(spec_path)
        .with_context(|| format!("failed to load spec from {}", spec_path.display()))?;
    let validation = spec.validate();
    for warning in &validation.warnings {
        tracing::warn!(warning = %warning, "spec warning");
    }
    if !validation.valid {
        bail!("invalid spec: {}", validation.errors.join(", "));
    }

    let store = Arc::new(
        Store::open(&state_dir.join("metadata.db"), &state_dir.join("artifacts"))
            .await
            .context("failed to open store")?,
    );

    let policy = Arc::new(PolicyEngine::new(Policy::default()));
    let provider = Arc::new(StubProvider::scripted_demo());
    let proxy = ToolProxy::new(Arc::clone(&store), Arc::clone(&policy));
    let runtime = SessionRuntime::new(Arc::clone(&store), policy, provider, proxy);

    // Surface runtime events as log lines.
    let mut events = runtime.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(
                session = %event.session_id,
                kind = ?event.kind,
                data = ?event.data,
                "runtime event"
            );
        }
    });

    let session_id = format!("session-{}", warden::store::now_secs());
    let mut metadata = HashMap::new();
    metadata.insert("env".to_string(), "dev".to_string());
    metadata.insert(
        "spec".to_string(),
        spec_path.to_string_lossy().into_owned(),
    );

    store
        .create_session(&Session::new(&session_id, metadata))
        .await
        .context("failed to create session")?;

    runtime
        .execute_session(&session_id)
        .await
        .context("session execution failed")?;

    println!("Session {session_id} complete.");
    Ok(())
}

fn handle_validate(spec_path: &PathBuf) -> anyhow::Result<()> {
    let spec = TaskSpec::load(spec_path)
        .with_context(|| format!("failed to load spec from {}", spec_path.display()))?;

    let validation = spec.validate();
    for warning in &validation.warnings {
        println!("warning: {warning}");
    }
    for error in &validation.errors {
        println!("error: {error}");
    }

    if !validation.valid {
        bail!("spec is invalid");
    }

    println!("Spec is valid: {}", spec.goal);
    Ok(())
}
