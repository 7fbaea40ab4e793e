//! kticket CLI - tickets as markdown files, safe under concurrent use.

use clap::Parser;
use kticket::cli::{Cli, Commands, DepCommands, LinkCommands};
use kticket::commands::{self, ListFilter, NewTicket, Output};
use kticket::config::{ENV_LOG, Settings};
use kticket::lock::CancelToken;
use kticket::ops::{self, BatchResult};
use kticket::store::Store;
use std::env;
use std::io::{self, Read};
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    init_logging();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            report(&e, None, human);
            process::exit(1);
        }
    }
}

fn report(e: &kticket::Error, id: Option<&str>, human: bool) {
    match (human, id) {
        (true, Some(id)) => eprintln!("Error: {id}: {e}"),
        (true, None) => eprintln!("Error: {e}"),
        (false, Some(id)) => eprintln!("{}", serde_json::json!({ "id": id, "error": e.to_string() })),
        (false, None) => eprintln!("{}", serde_json::json!({ "error": e.to_string() })),
    }
}

/// Log to stderr, filtered by `KT_LOG` (default `warn`). Stdout is reserved
/// for command output.
fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve settings and run the command. `Ok(false)` means a batch command
/// had per-ticket failures.
fn run(cli: Cli) -> Result<bool, kticket::Error> {
    let cwd = env::current_dir().map_err(|e| kticket::Error::io("get current dir", ".", e))?;
    let settings = Settings::resolve(&cwd, &cli.overrides())?;

    // Ctrl-C aborts a lock wait or `kt wait` with an error instead of
    // killing the process mid-write.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }

    let store = Store::new(&settings.store_dir)
        .with_lock_options(settings.lock_options().with_cancel(cancel.clone()));

    run_command(cli.command, &settings, &store, &cancel, cli.human_readable)
}

fn run_command(
    command: Commands,
    settings: &Settings,
    store: &Store,
    cancel: &CancelToken,
    human: bool,
) -> Result<bool, kticket::Error> {
    match command {
        Commands::Create {
            title,
            description,
            ticket_type,
            priority,
            assignee,
            external_ref,
            parent,
            deps,
            design,
            acceptance,
            tests,
        } => {
            let new = NewTicket {
                title,
                description,
                ticket_type,
                priority,
                assignee,
                external_ref,
                parent,
                deps,
                design,
                acceptance,
                tests,
            };
            output(&commands::create(settings, store, new)?, human);
        }
        Commands::Show { ids } => {
            let shown = commands::show(store, &ids)?;
            for failed in &shown.errors {
                report(&failed.error, Some(&failed.id), human);
            }
            if !shown.tickets.is_empty() || shown.errors.is_empty() {
                output(&shown, human);
            }
            return Ok(shown.errors.is_empty());
        }
        Commands::Ls {
            status,
            ticket_type,
            parent,
        } => {
            let filter = ListFilter {
                status,
                ticket_type,
                parent,
            };
            output(&commands::list(store, &filter)?, human);
        }
        Commands::AddNote { id, text } => {
            let text = match text {
                Some(text) => text,
                None => read_stdin()?,
            };
            output(&commands::add_note(store, &id, &text)?, human);
        }
        Commands::Ready => output(&commands::ready(store)?, human),
        Commands::Blocked => output(&commands::blocked(store)?, human),
        Commands::Closed { limit } => output(&commands::closed(store, limit)?, human),
        Commands::Start { ids } => return Ok(batch(ops::start(store, &ids), human)),
        Commands::Close { ids } => return Ok(batch(ops::close(store, &ids), human)),
        Commands::Reopen { ids } => return Ok(batch(ops::reopen(store, &ids), human)),
        Commands::Pass { ids } => return Ok(batch(ops::mark_passed(store, &ids), human)),
        Commands::Status { id, status } => {
            return Ok(batch(ops::set_status(store, &[id], status), human));
        }
        Commands::Dep { command } => match command {
            DepCommands::Add { id, dep } => output(&commands::dep_add(store, &id, &dep)?, human),
            DepCommands::Rm { id, dep } => output(&commands::dep_rm(store, &id, &dep)?, human),
            DepCommands::Tree { id, full } => output(&ops::dep_tree(store, &id, full)?, human),
        },
        Commands::Link { command } => match command {
            LinkCommands::Add { ids } => output(&commands::link_add(store, &ids)?, human),
            LinkCommands::Rm { a, b } => output(&commands::link_rm(store, &a, &b)?, human),
        },
        Commands::Rm { id } => output(&commands::rm(store, &id)?, human),
        Commands::Purge { yes } => output(&commands::purge(store, yes)?, human),
        Commands::Wait {
            id,
            interval,
            timeout,
        } => {
            let interval = seconds(interval, "--interval")?;
            let timeout = timeout.map(|t| seconds(t, "--timeout")).transpose()?;
            output(&commands::wait(store, &id, interval, timeout, cancel)?, human);
        }
        Commands::Stats => output(&commands::stats(store)?, human),
    }
    Ok(true)
}

fn read_stdin() -> Result<String, kticket::Error> {
    let mut text = String::new();
    io::stdin()
        .read_to_string(&mut text)
        .map_err(|e| kticket::Error::io("read note from stdin", "-", e))?;
    Ok(text)
}

fn seconds(value: f64, flag: &str) -> Result<Duration, kticket::Error> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| kticket::Error::InvalidInput(format!("{flag} must be a non-negative number of seconds")))
}

/// Print a batch result; returns whether every id succeeded.
fn batch(result: BatchResult, human: bool) -> bool {
    output(&result, human);
    result.is_ok()
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
