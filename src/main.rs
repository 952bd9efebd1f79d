//! skein - durable workflow engine

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::CommandFactory;
use clap_complete::generate;
use skein::cli::{Cli, Commands, ConfigCommands, PageCommands};
use skein::config::{
    format_config, format_config_paths, load_config, validate_config, ConfigSources, SkeinConfig,
};
use skein::models::{Page, Strand};
use skein::progs::{builtin_registry, LoggingRekeyDriver, PageNexus, SubnetRekey};
use skein::storage::{PgStore, StorageError, StrandFilter};
use skein::worker::{shutdown_signal, wait_for_shutdown_signal, LogPageSink, Worker};
use tracing_subscriber::EnvFilter;

/// Displays an error, with suggestions when the cause is a storage error.
fn display_error(err: &anyhow::Error) {
    if let Some(storage_err) = err.downcast_ref::<StorageError>() {
        eprintln!("{}", storage_err.display_rich());
        return;
    }

    for cause in err.chain() {
        if let Some(storage_err) = cause.downcast_ref::<StorageError>() {
            eprintln!("Error: {err}\n");
            eprintln!("Caused by: {}", storage_err.display_rich());
            return;
        }
    }

    eprintln!("Error: {err}");
}

fn print_validation_errors(errors: &[String]) {
    eprintln!("Configuration errors:");
    for error in errors {
        eprintln!("  - {error}");
    }
}

fn print_strand(strand: &Strand) {
    println!("Strand: {}", strand.id);
    println!("  Prog: {}", strand.prog);
    println!("  Label: {}", strand.label);
    if let Some(parent) = strand.parent_id {
        println!("  Parent: {parent}");
    }
    println!("  Stack Depth: {}", strand.stack.len());
    println!("  Schedule: {}", strand.schedule.to_rfc3339());
    match strand.lease {
        Some(lease) => println!("  Lease Until: {}", lease.to_rfc3339()),
        None => println!("  Lease: none"),
    }
    if let Some(exitval) = &strand.exitval {
        println!("  Exit Value: {exitval}");
    }
    if let Some(frame) = strand.top_frame() {
        if let (Some(at), Some(target)) = (frame.deadline_at, &frame.deadline_target) {
            println!("  Deadline: {target} by {}", at.to_rfc3339());
        }
        if let Some(page_id) = frame.page_id {
            println!("  Page: {page_id}");
        }
    }
}

fn print_page(page: &Page) {
    let state = match page.resolved_at {
        Some(at) => format!("resolved {}", at.to_rfc3339()),
        None => "open".to_string(),
    };
    println!("{}  {}  {}  {}", page.id, page.created_at.to_rfc3339(), state, page.summary);
}

async fn connect(config: &SkeinConfig) -> Result<PgStore> {
    if config.database_url.is_empty() {
        return Err(anyhow!(
            "database_url not configured. Set DATABASE_URL or add it to a config file."
        ));
    }
    let store = PgStore::connect(&config.database_url, config.max_connections)
        .await
        .context("failed to connect to the strand store")?;
    Ok(store)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        display_error(&e);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "skein", &mut io::stdout());
        return Ok(());
    }

    let mut config = load_config(cli.profile.as_deref(), cli.config.as_ref())?;
    if let Some(url) = cli.database_url.clone() {
        config.database_url = url;
    }

    // Config commands never touch the database.
    if let Commands::Config { command } = &cli.command {
        let sources = ConfigSources::discover().with_custom_config(cli.config.clone());
        match command {
            ConfigCommands::Show => {
                print!("{}", format_config(&config, &sources));
            }
            ConfigCommands::Validate => {
                let errors = validate_config(&config);
                if errors.is_empty() {
                    println!("Configuration is valid.");
                } else {
                    print_validation_errors(&errors);
                    std::process::exit(1);
                }
            }
            ConfigCommands::Paths => {
                print!("{}", format_config_paths(&sources));
            }
        }
        return Ok(());
    }

    let store = Arc::new(connect(&config).await?);
    let registry = builtin_registry(Arc::new(LogPageSink), Arc::new(LoggingRekeyDriver));
    let worker = Worker::new(store, registry)
        .with_lease_ttl(config.worker.effective_lease_ttl());

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => {}
        Commands::Migrate => {
            println!("Schema is up to date.");
        }
        Commands::Worker {
            once,
            id,
            time_budget_ms,
        } => {
            let errors = validate_config(&config);
            if !errors.is_empty() {
                print_validation_errors(&errors);
                std::process::exit(1);
            }

            let worker = match id {
                Some(id) => worker.with_worker_id(id),
                None => worker,
            };
            let mut runner_config = config.worker.to_runner_config();
            if let Some(ms) = time_budget_ms {
                runner_config.time_budget = Duration::from_millis(ms);
            }

            tracing::info!(
                worker_id = %worker.worker_id(),
                lease_ttl_secs = worker.lease_ttl().as_secs(),
                batch_size = runner_config.batch_size,
                "Worker starting"
            );

            if once {
                let report = worker.tick(&runner_config).await?;
                println!(
                    "due={} napped={} exited={} exhausted={} busy={} cleaned={} failed={}",
                    report.due,
                    report.napped,
                    report.exited,
                    report.exhausted,
                    report.busy,
                    report.cleaned,
                    report.failed
                );
            } else {
                let (shutdown_tx, shutdown_rx) = shutdown_signal();
                tokio::spawn(wait_for_shutdown_signal(shutdown_tx));
                worker.run(runner_config, shutdown_rx).await?;
            }
        }
        Commands::Status { strand_id, json } => match worker.store().get_strand(strand_id).await? {
            Some(strand) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&strand)?);
                } else {
                    print_strand(&strand);
                }
            }
            None => {
                eprintln!("Strand not found: {strand_id}");
                std::process::exit(1);
            }
        },
        Commands::List {
            prog,
            parent,
            limit,
            json,
        } => {
            let filter = StrandFilter {
                prog,
                parent_id: parent,
                include_terminal: true,
                limit,
            };
            let strands = worker.store().list_strands(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&strands)?);
            } else if strands.is_empty() {
                println!("No strands found.");
            } else {
                for strand in &strands {
                    let state = if strand.is_terminal() { "exited" } else { "live" };
                    println!(
                        "{}  {:<16} {:<24} {:<6} {}",
                        strand.id,
                        strand.prog,
                        strand.label,
                        state,
                        strand.schedule.to_rfc3339()
                    );
                }
            }
        }
        Commands::Incr { strand_id, name } => {
            let count = worker.increment(strand_id, &name).await?;
            println!("Incremented {name} on {strand_id} (pending: {count})");
        }
        Commands::Rekey {
            nics,
            deadline_secs,
        } => {
            let strand =
                SubnetRekey::assemble(worker.store(), &nics, deadline_secs.map(Duration::from_secs))
                    .await?;
            println!("Started rekey {} over {} nic(s)", strand.id, nics.len());
        }
        Commands::Pages { command } => match command {
            PageCommands::List { all, json } => {
                let pages = worker.store().list_pages(!all).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&pages)?);
                } else if pages.is_empty() {
                    println!("No pages found.");
                } else {
                    for page in &pages {
                        print_page(page);
                    }
                }
            }
            PageCommands::Create { summary } => {
                let page = PageNexus::assemble(worker.store(), &summary).await?;
                println!("Raised page {}", page.id);
            }
            PageCommands::Resolve { page_id } => {
                let owned_by_nexus = worker
                    .store()
                    .get_strand(page_id)
                    .await?
                    .is_some_and(|s| s.prog == PageNexus::NAME && !s.is_terminal());
                if owned_by_nexus {
                    PageNexus::request_resolve(worker.store(), page_id).await?;
                    println!("Requested resolution of page {page_id}");
                } else {
                    let page = worker.resolve_page(page_id).await?;
                    println!("Resolved page {}", page.id);
                }
            }
        },
    }

    Ok(())
}
