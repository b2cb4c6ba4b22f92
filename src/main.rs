use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use preload::config::Config;
use preload::{DataType, HttpTransport, PreloadCache, RequestDescriptor};

#[derive(Parser, Debug)]
#[command(name = "preload")]
#[command(about = "Speculative-fetch request cache diagnostics")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/preload/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Page URL overriding the configured one
  #[arg(long)]
  page_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the canonical cache key of a request
  Key(RequestArgs),
  /// Preload a request, claim it, and print the delivered result as JSON
  Fetch {
    #[command(flatten)]
    request: RequestArgs,

    /// Hand the body through as text instead of parsing JSON
    #[arg(long)]
    text: bool,
  },
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
  /// Request URL, absolute or relative to the page
  url: String,

  /// Body parameter as name=value (repeatable)
  #[arg(short, long = "data", value_parser = parse_param)]
  data: Vec<(String, String)>,

  #[arg(short, long, value_enum, default_value_t = MethodArg::Get)]
  method: MethodArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MethodArg {
  Get,
  Post,
}

impl RequestArgs {
  fn descriptor(&self) -> RequestDescriptor {
    let base = match self.method {
      MethodArg::Get => RequestDescriptor::get(&self.url),
      MethodArg::Post => RequestDescriptor::post(&self.url),
    };
    self
      .data
      .iter()
      .fold(base, |d, (name, value)| d.param(name, value.as_str()))
  }
}

fn parse_param(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

/// Install the tracing subscriber; logs go to stderr unless a log dir is configured.
fn init_tracing(config: &Config) -> WorkerGuard {
  let filter = EnvFilter::try_from_env("PRELOAD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  let (writer, guard) = match &config.log_dir {
    Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "preload.log")),
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(config.log_dir.is_none())
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override page URL if specified on command line
  let config = if let Some(page_url) = args.page_url {
    Config { page_url, ..config }
  } else {
    config
  };

  let _guard = init_tracing(&config);

  let page = config.page_context()?;
  let transport = HttpTransport::new(page.page_url().clone());
  let cache = PreloadCache::with_options(transport, page, config.cache_options());

  match args.command {
    Command::Key(request) => {
      println!("{}", cache.canonical_key(&request.descriptor())?);
    }
    Command::Fetch { request, text } => {
      let data_type = if text { DataType::Text } else { DataType::Json };
      let descriptor = request.descriptor().with_data_type(data_type);

      let handle = cache.preload(descriptor.clone())?;
      let completion = cache
        .claim(&descriptor)
        .await?
        .ok_or_else(|| eyre!("Preload for {} was not claimable", handle.key()))?;
      handle.wait().await?;

      println!("{}", serde_json::to_string_pretty(&completion.response)?);
      if let Some(meta) = completion.meta {
        eprintln!("{} {}", meta.status, meta.url);
      }
    }
  }

  Ok(())
}
