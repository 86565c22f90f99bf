//! audit-worker CLI: run the worker, enqueue audits, inspect jobs and runs.

use audit_worker::artifacts::{ArtifactStore, HttpArtifactStore, LocalArtifactStore};
use audit_worker::audit::{LighthouseConfig, LighthouseEngine};
use audit_worker::config::{ArtifactTarget, Config};
use audit_worker::db::{Db, Tables};
use audit_worker::model::{JobId, Notification, RunId};
use audit_worker::router::{MessageRouter, RouterConfig};
use audit_worker::store::{Consistency, RunLedger};
use audit_worker::telemetry::{TelemetryConfig, init_telemetry};
use audit_worker::worker::{Worker, WorkerConfig};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "audit-worker", about = "Idempotent page-audit worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker until Ctrl-C
    Serve {
        /// Deliveries processed in parallel
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
        /// Visibility timeout in seconds; must exceed one full audit
        #[arg(long, default_value_t = 300)]
        visibility_timeout: i32,
    },
    /// Enqueue an audit request
    Publish {
        /// Parent job id
        job_id: String,
        /// Page to audit
        url: String,
        /// Lighthouse options as a JSON object
        #[arg(long)]
        options: Option<String>,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Run operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Show a job's counters and its runs
    Show {
        job_id: String,
        /// Maximum runs to list
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Show a run
    Show { run_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            max_concurrent,
            visibility_timeout,
        } => cmd_serve(config, max_concurrent, visibility_timeout).await,
        Command::Publish {
            job_id,
            url,
            options,
        } => {
            let db = connect(&config).await?;
            cmd_publish(&db, &config, job_id, url, options).await
        }
        Command::Job {
            action: JobAction::Show { job_id, limit },
        } => {
            let db = connect(&config).await?;
            cmd_job_show(&db, job_id, limit).await
        }
        Command::Run {
            action: RunAction::Show { run_id },
        } => {
            let db = connect(&config).await?;
            cmd_run_show(&db, run_id).await
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(
        config.database_url.expose_secret(),
        config
            .database_replica_url
            .as_ref()
            .map(|url| url.expose_secret()),
        Tables {
            runs: config.runs_table.clone(),
            jobs: config.jobs_table.clone(),
        },
    )
    .await?;
    db.ensure_schema().await?;
    db.create_queue(&config.audit_queue).await?;
    db.create_queue(&config.dead_letter_queue).await?;
    Ok(db)
}

async fn cmd_serve(
    config: Config,
    max_concurrent: usize,
    visibility_timeout: i32,
) -> anyhow::Result<()> {
    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "audit-worker".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(connect(&config).await?);

    let artifacts: Arc<dyn ArtifactStore> = match &config.artifacts {
        ArtifactTarget::Directory(root) => Arc::new(LocalArtifactStore::new(root)),
        ArtifactTarget::Http { endpoint, bucket } => {
            Arc::new(HttpArtifactStore::new(endpoint, bucket)?)
        }
    };
    let auditor = Arc::new(LighthouseEngine::new(LighthouseConfig {
        lighthouse_bin: config.lighthouse_bin.clone(),
        chrome_bin: config.chrome_bin.clone(),
        work_dir: config.audit_work_dir.clone(),
        ..LighthouseConfig::default()
    }));

    let router = MessageRouter::new(
        db.clone(),
        artifacts,
        auditor,
        RouterConfig {
            dead_letter_topic: config.dead_letter_queue.clone(),
            simulate_fault_before_audit: config.simulate_fault_before_audit,
        },
    );

    let worker = Worker::new(
        Arc::clone(&db),
        Arc::new(router),
        WorkerConfig {
            audit_queue: config.audit_queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            visibility_timeout,
            max_deliveries: config.max_deliveries,
            max_concurrent,
            ..WorkerConfig::default()
        },
    );

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    telemetry.force_flush();
    Ok(())
}

async fn cmd_publish(
    db: &Db,
    config: &Config,
    job_id: String,
    url: String,
    options: Option<String>,
) -> anyhow::Result<()> {
    let options: serde_json::Value = match options {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    if !options.is_object() {
        anyhow::bail!("--options must be a JSON object");
    }

    let notification =
        Notification::audit_request(&config.audit_queue, &JobId(job_id), url, &options);
    let msg_id = db.publish(&config.audit_queue, &notification).await?;
    println!(
        "Published: run {} (queue message {msg_id})",
        notification.message_id
    );
    Ok(())
}

async fn cmd_job_show(db: &Db, job_id: String, limit: i64) -> anyhow::Result<()> {
    let job_id = JobId(job_id);
    let counts = db.get_job(&job_id).await?;

    println!("Job:        {job_id}");
    println!("Succeeded:  {}", counts.page_count_success);
    println!("Failed:     {}", counts.page_count_error);

    let runs = db.list_runs(&job_id, limit).await?;
    if runs.is_empty() {
        return Ok(());
    }
    println!("---");
    println!("{:<36}  {:<7}  {:<16}  URL", "RUN", "STATUS", "CREATED");
    println!("{}", "-".repeat(100));
    for run in &runs {
        println!(
            "{:<36}  {:<7}  {:<16}  {}",
            run.run_id,
            if run.error.is_some() { "error" } else { "ok" },
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.url.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} run(s)", runs.len());
    Ok(())
}

async fn cmd_run_show(db: &Db, run_id: String) -> anyhow::Result<()> {
    let run_id = RunId(run_id);
    let Some(run) = db.get(&run_id, Consistency::Strong).await? else {
        anyhow::bail!("no run {run_id}");
    };

    println!("Run:      {}", run.run_id);
    println!("Job:      {}", run.job_id);
    println!("URL:      {}", run.url.as_deref().unwrap_or("-"));
    println!("Created:  {}", run.created_at);
    match run.error {
        Some(ref err) => println!("Error:    {err}"),
        None => println!("Status:   ok"),
    }
    Ok(())
}
