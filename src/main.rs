use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, warn};
use restwell::cache::ResponseCache;
use restwell::config::parse_pair;
use restwell::http::Method;
use restwell::{Client, ClientConfig, RequestOptions};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// restwell - a resilient REST client
///
/// Sends a request to a REST API, retrying transient failures and caching
/// GET responses, and prints the JSON response body.
///
/// Credentials are read from environment variables named in the config
/// file (RESTWELL_API_KEY, RESTWELL_TOKEN or RESTWELL_SECRET by default).
///
/// Examples:
///   restwell --base-url https://api.example.com get /users/1
///   restwell post /items --data '{"name": "x"}' --idempotency-key abc
#[derive(Parser, Debug)]
#[command(author, version = env!("RESTWELL_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file (also via RESTWELL_CONFIG)
    #[arg(long, short = 'c', env = "RESTWELL_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Base URL every endpoint is resolved against (also via RESTWELL_BASE_URL)
    #[arg(long = "base-url", env = "RESTWELL_BASE_URL", value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Per-attempt timeout in milliseconds
    #[arg(long = "timeout-ms", value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    /// Maximum attempts per call, including the first
    #[arg(long = "max-attempts", value_name = "N", global = true)]
    max_attempts: Option<u32>,

    /// Deadline for the whole call in milliseconds, covering retries
    #[arg(long = "deadline-ms", value_name = "MS", global = true)]
    deadline_ms: Option<u64>,

    /// Load the response cache from and save it to this file
    #[arg(long = "cache-file", value_name = "PATH", global = true)]
    cache_file: Option<PathBuf>,

    /// Persist the response cache in the user cache directory
    #[arg(long = "persist-cache", global = true)]
    persist_cache: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a GET request
    Get(CallArgs),
    /// Send a POST request
    Post(CallArgs),
    /// Send a PUT request
    Put(CallArgs),
    /// Send a PATCH request
    Patch(CallArgs),
    /// Send a DELETE request
    Delete(CallArgs),
}

#[derive(clap::Args, Debug)]
struct CallArgs {
    /// Endpoint path relative to the base URL, or an absolute URL
    #[arg(value_name = "ENDPOINT")]
    endpoint: String,

    /// Query parameter, repeatable
    #[arg(long = "query", short = 'q', value_name = "KEY=VALUE", value_parser = parse_query)]
    query: Vec<(String, String)>,

    /// Request header, repeatable
    #[arg(long = "header", short = 'H', value_name = "NAME:VALUE", value_parser = parse_header)]
    header: Vec<(String, String)>,

    /// JSON request body
    #[arg(long, short = 'd', value_name = "JSON")]
    data: Option<String>,

    /// Makes a non-idempotent request safe to retry after ambiguous failures
    #[arg(long = "idempotency-key", value_name = "KEY")]
    idempotency_key: Option<String>,

    /// Skip the cache lookup
    #[arg(long = "no-cache")]
    no_cache: bool,
}

fn parse_query(raw: &str) -> Result<(String, String)> {
    parse_pair(raw, '=')
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    parse_pair(raw, ':')
}

impl Commands {
    fn into_parts(self) -> (Method, CallArgs) {
        match self {
            Commands::Get(args) => (Method::Get, args),
            Commands::Post(args) => (Method::Post, args),
            Commands::Put(args) => (Method::Put, args),
            Commands::Patch(args) => (Method::Patch, args),
            Commands::Delete(args) => (Method::Delete, args),
        }
    }
}

impl Cli {
    /// File configuration with command-line overrides applied.
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(deadline_ms) = self.deadline_ms {
            config.deadline_ms = Some(deadline_ms);
        }
        Ok(config)
    }

    fn cache_path(&self) -> Option<PathBuf> {
        self.cache_file.clone().or_else(|| {
            if self.persist_cache {
                default_cache_path()
            } else {
                None
            }
        })
    }
}

fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("restwell").join("cache.json"))
}

fn load_cache(path: &Path, config: &ClientConfig) -> Option<ResponseCache> {
    if !path.exists() {
        return None;
    }
    match ResponseCache::load(path, &config.cache) {
        Ok(cache) => {
            debug!("Loaded {} cached responses from {}", cache.len(), path.display());
            Some(cache)
        }
        Err(e) => {
            warn!("Ignoring unreadable cache file {}: {}", path.display(), e);
            None
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.client_config()?;
    if config.base_url.is_empty() {
        anyhow::bail!("No base URL given; use --base-url, RESTWELL_BASE_URL or a config file");
    }
    let cache_path = cli.cache_path();

    let mut builder = Client::builder(config.clone());
    if let Some(cache) = cache_path.as_deref().and_then(|p| load_cache(p, &config)) {
        builder = builder.cache(Arc::new(cache));
    }
    let client = builder.build().context("Failed to create client")?;

    let (method, args) = cli.command.into_parts();
    let body = match &args.data {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("--data is not valid JSON")?;
            Some(serde_json::to_vec(&value)?)
        }
        None => None,
    };
    let options = RequestOptions {
        query: args.query,
        headers: args.header,
        deadline: None,
        idempotency_key: args.idempotency_key,
        bypass_cache: args.no_cache,
    };

    let response = client
        .send(method, &args.endpoint, body, &options)
        .await
        .with_context(|| format!("{} {} failed", method, args.endpoint))?;

    let value: Value = response.decode()?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if let Some(path) = cache_path {
        let saved = client
            .cache()
            .save(&path)
            .with_context(|| format!("Failed to save cache to {}", path.display()))?;
        debug!("Saved {} cached responses to {}", saved, path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    run(cli).await
}
