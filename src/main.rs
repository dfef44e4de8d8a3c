mod app;
mod cache;
mod config;
mod control;
mod data;
mod fetch;
mod router;
mod store;
mod survey;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "carnet")]
#[command(about = "Offline-first field survey collection agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/carnet/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the agent: warm caches, watch connectivity, drain the queue
  Run,
  /// Show queued submissions
  Status,
  /// Force a drain of the submission queue
  Sync,
  /// Delete every named cache (queued submissions are kept)
  ClearCache,
  /// Submit a survey payload from a JSON file, or "-" for stdin
  Submit { file: PathBuf },
  /// Search the bulk datasets
  Search {
    #[command(subcommand)]
    command: SearchCommand,
  },
  /// Inspect the question graph
  Flow {
    #[command(subcommand)]
    command: FlowCommand,
  },
}

#[derive(Subcommand, Debug)]
enum SearchCommand {
  /// Stations by name
  Gares {
    query: String,
    #[arg(long, default_value_t = data::DEFAULT_SEARCH_LIMIT)]
    limit: usize,
  },
  /// Communes by name and/or postal-code prefix
  Communes {
    #[arg(long, default_value = "")]
    commune: String,
    #[arg(long, default_value = "")]
    postal: String,
    #[arg(long, default_value_t = data::DEFAULT_SEARCH_LIMIT)]
    limit: usize,
  },
  /// Streets by name
  Streets {
    query: String,
    #[arg(long, default_value_t = data::DEFAULT_SEARCH_LIMIT)]
    limit: usize,
  },
}

#[derive(Subcommand, Debug)]
enum FlowCommand {
  /// Validate the question graph
  Check,
  /// Next question id given the current question and selected option
  Next {
    current: String,
    #[arg(long)]
    option: Option<u32>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let _log_guard = init_tracing(&config, matches!(args.command, Command::Run))?;

  match args.command {
    Command::Run => run_agent(&config).await,
    Command::Status => {
      let app = app::App::new(&config)?;
      print_json(&app.handle.sync_status().await)
    }
    Command::Sync => {
      let app = app::App::new(&config)?;
      let ack = app.handle.force_sync().await;
      print_json(&ack)?;
      if ack.success {
        Ok(())
      } else {
        Err(eyre!("Sync failed"))
      }
    }
    Command::ClearCache => {
      let app = app::App::new(&config)?;
      let ack = app.handle.clear_cache().await;
      print_json(&ack)?;
      if ack.success {
        Ok(())
      } else {
        Err(eyre!("Cache clear failed"))
      }
    }
    Command::Submit { file } => submit(&config, &file).await,
    Command::Search { command } => run_search(&config, command).await,
    Command::Flow { command } => run_flow(&config, command),
  }
}

/// Long-running agent mode: the worker does the work; the foreground keeps
/// a sync status current and logs deliveries until interrupted.
async fn run_agent(config: &config::Config) -> Result<()> {
  let app = app::App::new(config)?;
  let mut events = app.subscribe_sync_events();

  let mut status = control::SyncStatus::default();
  status.apply_snapshot(&app.handle.sync_status().await);
  info!(pending = status.pending_count, "Agent started");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("Shutting down");
        break;
      }
      event = events.recv() => match event {
        Ok(event) => {
          status.apply_event(&event);
          info!(pending = status.pending_count, "Survey delivered");
        }
        Err(RecvError::Lagged(_)) => {
          status.apply_snapshot(&app.handle.sync_status().await);
        }
        Err(RecvError::Closed) => break,
      }
    }
  }

  Ok(())
}

/// Push one payload through the interception layer: delivered when the
/// endpoint is reachable, queued when it is not.
async fn submit(config: &config::Config, file: &Path) -> Result<()> {
  let payload = if file == Path::new("-") {
    let mut buffer = String::new();
    std::io::stdin()
      .read_to_string(&mut buffer)
      .map_err(|e| eyre!("Failed to read payload from stdin: {}", e))?;
    buffer
  } else {
    std::fs::read_to_string(file)
      .map_err(|e| eyre!("Failed to read payload {}: {}", file.display(), e))?
  };

  let app = app::App::new(config)?;
  let request = fetch::Request::post(config.endpoint.submit_url.as_str(), payload)
    .with_header("content-type", "application/json");
  let response = app.interceptor.fetch(request).await;

  let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap_or_default();
  if response.is_success() && body["offline"] == true {
    println!("Offline: survey queued for sync when online");
    Ok(())
  } else if response.is_success() {
    println!("Survey submitted");
    Ok(())
  } else {
    Err(eyre!("Submission failed: {}", response.body_string()))
  }
}

async fn run_search(config: &config::Config, command: SearchCommand) -> Result<()> {
  let app = app::App::new(config)?;

  match command {
    SearchCommand::Gares { query, limit } => {
      print_json(&app.datasets.search_gares(&query, limit).await)
    }
    SearchCommand::Communes {
      commune,
      postal,
      limit,
    } => print_json(&app.datasets.search_communes(&commune, &postal, limit).await),
    SearchCommand::Streets { query, limit } => {
      print_json(&app.datasets.search_streets(&query, limit).await)
    }
  }
}

fn run_flow(config: &config::Config, command: FlowCommand) -> Result<()> {
  let path = config
    .questions_file
    .as_ref()
    .ok_or_else(|| eyre!("questions_file is not set in the config"))?;
  let graph = survey::QuestionGraph::load(path)?;

  match command {
    FlowCommand::Check => {
      let issues = graph.validate();
      if issues.is_empty() {
        let entry = graph.first().map(|q| q.id.as_str()).unwrap_or(survey::END_NODE);
        println!("Question graph OK, entry at {}", entry);
        Ok(())
      } else {
        for issue in &issues {
          eprintln!("{}", issue);
        }
        Err(eyre!("{} problems found in the question graph", issues.len()))
      }
    }
    FlowCommand::Next { current, option } => {
      let next = graph.next_id(&current, option)?;
      if survey::QuestionGraph::is_end(&next) {
        println!("end (survey complete)");
      } else {
        println!("{}", next);
      }
      Ok(())
    }
  }
}

fn init_tracing(
  config: &config::Config,
  to_file: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  if to_file {
    let dir = config.log_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
      dir,
      "carnet.log",
    ));

    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(writer)
      .with_ansi(false)
      .init();
    Ok(Some(guard))
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    Ok(None)
  }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let rendered =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", rendered);
  Ok(())
}
