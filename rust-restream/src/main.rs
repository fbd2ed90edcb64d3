mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rust_restream::{
    config::{JobConfig, create_profile, delete_profile, discover_profiles, group_counts},
    domain::JobState,
    logging, panic_hook,
    pipeline::detect_version,
    supervisor::{JobEvent, JobSupervisor, SupervisorConfig, WorkerCommand},
    utils::signal::shutdown_signal,
    worker::{WorkerOptions, run_worker},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Args, Commands, SuperviseArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads its env fallbacks
    dotenvy::dotenv().ok();

    let args = Args::parse();

    match args.command {
        Commands::Supervise(args) => supervise(args).await,
        Commands::Worker {
            config,
            ignore_stdin,
        } => {
            logging::init_worker_logging()?;
            panic_hook::install_worker();
            run_worker(&config, WorkerOptions { ignore_stdin }).await?;
            Ok(())
        }
        Commands::List {
            profiles,
            group,
            json,
        } => {
            logging::init_console_logging();
            list(&profiles.profiles, group.as_deref(), json)
        }
        Commands::Groups { profiles } => {
            logging::init_console_logging();
            groups(&profiles.profiles)
        }
        Commands::Init {
            profiles,
            source_id,
            group,
        } => {
            logging::init_console_logging();
            let path = create_profile(&profiles.profiles, &source_id, group.as_deref())?;
            println!("Created {}", path.display());
            println!("Edit the probe command and stream key before starting the job.");
            Ok(())
        }
        Commands::Delete {
            profiles,
            job_id,
            force,
        } => {
            logging::init_console_logging();
            let dir = delete_profile(&profiles.profiles, &job_id, force)?;
            println!("Deleted {}", dir.display());
            Ok(())
        }
        Commands::Check { config } => {
            logging::init_console_logging();
            check(&config).await
        }
    }
}

async fn supervise(args: SuperviseArgs) -> anyhow::Result<()> {
    let (logging_config, _guard) = logging::init_supervisor_logging(&args.log_dir)?;
    panic_hook::install(&args.log_dir);
    if let Some(filter) = &args.log_filter {
        logging_config.set_filter(filter)?;
    }
    info!(
        filter = %logging_config.get_filter(),
        log_dir = %logging_config.log_dir().display(),
        "Supervisor starting"
    );

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel.clone());

    let mut profiles = discover_profiles(&args.profiles.profiles).with_context(|| {
        format!("Failed to read profiles from {}", args.profiles.profiles.display())
    })?;
    if !args.jobs.is_empty() {
        for job in &args.jobs {
            if !profiles.iter().any(|p| &p.job_id == job) {
                warn!(job_id = %job, "No such profile");
            }
        }
        profiles.retain(|p| args.jobs.contains(&p.job_id));
    }
    profiles.retain(|p| p.in_group(args.group.as_deref()));
    if profiles.is_empty() {
        warn!(profiles = %args.profiles.profiles.display(), "No profiles to run");
        return Ok(());
    }

    let config = SupervisorConfig {
        stop_timeout: Duration::from_secs(args.stop_timeout_secs),
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
    };
    let worker = WorkerCommand::current_exe().context("Failed to locate own executable")?;
    let (supervisor, mut events) = JobSupervisor::new(config, worker);

    for profile in &profiles {
        if let Err(e) = supervisor.start(&profile.job_id, &profile.config_path) {
            error!(job_id = %profile.job_id, error = %e, "Failed to start job");
        }
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!(signal, "Shutdown requested");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                render(&event, args.json);
                if event.event.state() == Some(JobState::Stopped) && supervisor.job_count() == 0 {
                    info!("All jobs have stopped");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let report = supervisor.shutdown().await;
    drain(&mut events, args.json);

    if !report.all_graceful() {
        warn!(
            forced = report.forced_terminations,
            "Some workers had to be killed"
        );
    }
    Ok(())
}

fn render(event: &JobEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!(error = %e, "Failed to serialize event"),
        }
    } else {
        logging::log_job_event(event);
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<JobEvent>, json: bool) {
    while let Ok(event) = events.try_recv() {
        render(&event, json);
    }
}

fn list(root: &Path, group: Option<&str>, json: bool) -> anyhow::Result<()> {
    let mut profiles = discover_profiles(root)
        .with_context(|| format!("Failed to read profiles from {}", root.display()))?;
    profiles.retain(|p| p.in_group(group));

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("No profiles found in {}", root.display());
        return Ok(());
    }

    let width = profiles.iter().map(|p| p.job_id.len()).max().unwrap_or(0).max(6);
    let group_width = profiles.iter().map(|p| p.group.len()).max().unwrap_or(0).max(5);
    println!("{:<width$}  {:<group_width$}  CONFIG", "JOB ID", "GROUP");
    for profile in &profiles {
        println!(
            "{:<width$}  {:<group_width$}  {}",
            profile.job_id,
            profile.group,
            profile.config_path.display()
        );
    }
    Ok(())
}

fn groups(root: &Path) -> anyhow::Result<()> {
    let profiles = discover_profiles(root)
        .with_context(|| format!("Failed to read profiles from {}", root.display()))?;
    for (group, count) in group_counts(&profiles) {
        println!("{}\t{}", group, count);
    }
    Ok(())
}

async fn check(path: &Path) -> anyhow::Result<()> {
    let config = JobConfig::load(path)?;
    println!("Config OK: job {}", config.source_id());

    let version = detect_version(&config.encoder.binary_path)
        .await
        .with_context(|| format!("Encoder '{}' is not usable", config.encoder.binary_path))?;
    println!("Encoder: {}", version);
    Ok(())
}
