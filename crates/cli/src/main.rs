//! `plantflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    start the engine workers and the REST API.
//! - `worker`   start the engine workers only, on this process's own queue.
//! - `migrate`  run pending database migrations.
//! - `validate` check a workflow definition file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use agents::builtin::{default_registry, Collaborators};
use db::{InMemoryStorage, PgStorage, WorkflowStore};
use engine::{
    validate_dag, AllowAll, Authorizer, EngineConfig, EngineError, RoleAuthorizer, WorkflowDefinition, WorkflowEngine,
};

const WORKER_ABOUT: &str = "Run the engine workers without the API";
const WORKER_LONG_ABOUT: &str = "Run the engine workers without the API.

Queue, locks and leader election live in this process's in-memory coordination \
store, so the worker only drains executions submitted through this same \
process. It does not pick up work queued by a separate `serve` process, even \
when both share a DATABASE_URL. Run `serve` for a working single-node setup.";

#[derive(Parser)]
#[command(name = "plantflow", about = "Distributed workflow orchestration engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and serve the REST API.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
        /// PostgreSQL URL; without one, state lives in memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Skip role checks and let every caller do everything.
        #[arg(long, env = "PLANTFLOW_OPEN_ACCESS")]
        open_access: bool,
    },
    #[command(about = WORKER_ABOUT, long_about = WORKER_LONG_ABOUT)]
    Worker {
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Skip role checks and let every caller do everything.
        #[arg(long, env = "PLANTFLOW_OPEN_ACCESS")]
        open_access: bool,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve { bind, database_url, open_access } => {
            let engine = build_engine(database_url.as_deref(), open_access).await?;
            engine.start()?;
            info!(%bind, "starting API server");
            api::serve(&bind, engine.clone(), shutdown_signal()).await.context("API server failed")?;
            report(engine.stop().await);
        }
        Command::Worker { database_url, open_access } => {
            warn!("worker only processes executions submitted through this process, see `plantflow worker --help`");
            let engine = build_engine(database_url.as_deref(), open_access).await?;
            engine.start()?;
            info!("worker running, press Ctrl-C to stop");
            shutdown_signal().await;
            report(engine.stop().await);
        }
        Command::Migrate { database_url } => {
            let pool = db::create_pool(&database_url, 2).await.context("failed to connect to database")?;
            db::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied");
        }
        Command::Validate { path } => validate(&path)?,
    }
    Ok(())
}

/// Role checks against the default role table, unless `open` is set.
fn authorizer(open: bool) -> Arc<dyn Authorizer> {
    if open {
        warn!("open access enabled, every caller may register, run and cancel workflows");
        Arc::new(AllowAll)
    } else {
        Arc::new(RoleAuthorizer::with_default_roles())
    }
}

async fn build_engine(database_url: Option<&str>, open_access: bool) -> Result<WorkflowEngine> {
    let config = EngineConfig::from_env()?;
    let storage: Arc<dyn WorkflowStore> = match database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.pool.max_size as u32).await.context("failed to connect to database")?;
            Arc::new(PgStorage::new(pool))
        }
        None => {
            warn!("no DATABASE_URL given, using in-memory storage");
            Arc::new(InMemoryStorage::new())
        }
    };
    let engine = WorkflowEngine::builder()
        .config(config)
        .storage(storage)
        .authorizer(authorizer(open_access))
        .agents(default_registry(&Collaborators::default()))
        .build()
        .await?;
    Ok(engine)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("shutdown requested");
}

fn report(report: engine::ShutdownReport) {
    if report.abandoned_executions > 0 {
        warn!(abandoned = report.abandoned_executions, "executions were still running at shutdown");
    }
    info!(
        released_resources = report.released_resources,
        abandoned_connections = report.abandoned_connections,
        "engine stopped"
    );
}

fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mut raw: Value = serde_json::from_str(&content).context("invalid JSON")?;
    // Files usually omit the id; the DAG check does not care which one it gets.
    if let Some(obj) = raw.as_object_mut() {
        obj.entry("id").or_insert_with(|| Value::String(Uuid::nil().to_string()));
    }
    let definition: WorkflowDefinition = serde_json::from_value(raw).context("not a workflow definition")?;

    let registry = default_registry(&Collaborators::default());
    for step in definition.steps.iter().filter(|s| !registry.contains(&s.agent_type)) {
        println!("warning: step '{}' uses agent type '{}' which is not built in", step.id, step.agent_type);
    }

    match validate_dag(&definition) {
        Ok(order) => {
            println!("valid, execution order: {}", order.join(" -> "));
            Ok(())
        }
        Err(EngineError::CycleDetected { path }) => bail!("cycle detected: {}", path.join(" -> ")),
        Err(e) => bail!("invalid workflow: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use engine::{Actor, Permission};

    #[tokio::test]
    async fn anonymous_callers_need_open_access() {
        let anonymous = Actor::new("anonymous", &[]);
        let denied = authorizer(false).require_permission(&anonymous, Permission::WorkflowRegister, "wf").await;
        assert!(matches!(denied, Err(EngineError::Unauthorized { .. })));
        assert!(authorizer(false).require_permission(&Actor::system(), Permission::WorkflowRegister, "wf").await.is_ok());
        assert!(authorizer(true).require_permission(&anonymous, Permission::WorkflowRegister, "wf").await.is_ok());
    }

    #[test]
    fn open_access_defaults_off() {
        let cli = Cli::try_parse_from(["plantflow", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { open_access: false, .. }));
        let cli = Cli::try_parse_from(["plantflow", "worker", "--open-access"]).unwrap();
        assert!(matches!(cli.command, Command::Worker { open_access: true, .. }));
    }

    #[test]
    fn worker_help_states_its_queue_is_local() {
        let cli = Cli::command();
        let worker = cli.find_subcommand("worker").unwrap();
        let help = worker.get_long_about().unwrap().to_string();
        assert!(help.contains("in-memory coordination"));
        assert!(help.contains("Run `serve`"));
    }
}
