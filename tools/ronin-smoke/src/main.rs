//! Smoke harness for the Ronin offline cache and generation relay.
//!
//! Runs the real stack (disk cache store, HTTP loader, relay client) from the
//! command line.
//!
//! ## Usage
//!
//! ```bash
//! # Install the configured release and activate it if nothing holds it back
//! ronin-smoke install
//!
//! # Install while a page holds the old generation, then let the page go
//! ronin-smoke activate --version ronins-maths-v4.1
//!
//! # Same, but force activation with SKIP_WAITING
//! ronin-smoke skip-waiting --version ronins-maths-v4.1
//!
//! # Route requests through the current generation
//! ronin-smoke fetch http://localhost:8888/index.html
//!
//! # Ask the relay for a visualization
//! ronin-smoke generate "area of a trapezium"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use ronin_common::{init_logging, LogConfig, LogFormat};
use ronin_core::{AppConfig, HistoryStore, LocalStorage};
use ronin_net::{LoaderConfig, Request, ResourceLoader};
use ronin_relay::{user_message, RelayClient};
use ronin_sw::{
    AssetManifest, CacheHandle, CacheStorage, DiskCacheStorage, GenerationId,
    LifecycleController, LifecycleEvent, Release, SwConfig, SwError,
};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "ronin-smoke")]
#[command(about = "Smoke harness for the Ronin offline cache and generation relay")]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format (compact, pretty, json)
    #[arg(long, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Log filter directives, overriding -v and RUST_LOG (e.g. "ronin_sw=trace")
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a release; it activates at once when no page holds the old one
    Install {
        /// Cache version to install instead of the configured one
        #[arg(long)]
        version: Option<String>,
    },

    /// Install while a page holds the current generation, then detach it
    Activate {
        #[arg(long)]
        version: Option<String>,
    },

    /// Install while a page holds the current generation, then post SKIP_WAITING
    SkipWaiting {
        #[arg(long)]
        version: Option<String>,
    },

    /// Route GET requests through the current generation
    Fetch {
        /// URLs, absolute or relative to the origin
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// List cache generations on disk
    Generations,

    /// Generate a visualization through the relay
    Generate {
        prompt: String,
        /// Image to send along with the prompt
        #[arg(long)]
        image: Option<PathBuf>,
        /// Write the generated HTML here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show or clear the generation history
    History {
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut log_config = LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format);
    if let Some(filter) = &cli.log_filter {
        log_config = log_config.with_filter(filter.as_str());
    }
    init_logging(log_config);

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(AppConfig::default().data_dir.join("config.json"))?,
    };

    match cli.command {
        Commands::Install { version } => {
            let (controller, mut events) = controller(&config, version).await?;
            match controller.install().await {
                Ok(id) => println!("Installed {}", id),
                Err(SwError::GenerationInUse(id)) => println!("{} is already current", id),
                Err(err) => return Err(err.into()),
            }
            print_events(&mut events);
            println!("State: {:?}", controller.state().await);
        }

        Commands::Activate { version } => {
            let (controller, mut events) = controller(&config, version).await?;
            let page = controller.attach_client().await;
            controller.install().await?;
            println!("After install: {:?}", controller.state().await);
            let activated = controller.detach_client(page).await?;
            println!("Page detached, activated: {}", activated);
            print_events(&mut events);
        }

        Commands::SkipWaiting { version } => {
            let (controller, mut events) = controller(&config, version).await?;
            let page = controller.attach_client().await;
            controller.install().await?;
            println!("After install: {:?}", controller.state().await);
            let activated = controller.post_message(r#"{"type":"SKIP_WAITING"}"#).await?;
            println!("SKIP_WAITING, activated: {}", activated);
            println!(
                "Page now controlled by: {}",
                controller
                    .controlled_by(page)
                    .await
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            print_events(&mut events);
        }

        Commands::Fetch { urls } => {
            let (controller, _events) = controller(&config, None).await?;
            let origin = config.origin_url()?;
            for raw in urls {
                let url = origin.join(&raw)?;
                match controller.handle_fetch(Request::get(url.clone())).await {
                    Ok(routed) => println!(
                        "{} {} {:?} via {:?} ({} bytes)",
                        routed.response.status.as_u16(),
                        url,
                        routed.source,
                        routed.policy,
                        routed.response.body().len()
                    ),
                    Err(err) => println!("ERR {} {}", url, err),
                }
            }
        }

        Commands::Generations => {
            let storage = DiskCacheStorage::open_dir(config.generations_dir()).await?;
            let generations = storage.generations().await?;
            if generations.is_empty() {
                println!("No generations in {}", storage.root().display());
            }
            for generation in generations {
                let keys = storage.keys(&CacheHandle::new(generation.clone())).await?;
                let marker = if generation.as_str() == config.cache_version {
                    " (configured)"
                } else {
                    ""
                };
                println!("{}{}: {} entries", generation, marker, keys.len());
                for key in keys {
                    println!("  {}", key);
                }
            }
        }

        Commands::Generate {
            prompt,
            image,
            output,
        } => {
            let loader = ResourceLoader::new(loader_config(&config))?;
            let client = RelayClient::new(Arc::new(loader), config.relay_url()?);
            let image = image.as_deref().map(data_url).transpose()?;

            let code = match client.generate(&prompt, image.as_deref()).await {
                Ok(code) => code,
                Err(err) => bail!("{}", user_message(&err)),
            };

            let mut history = history(&config)?;
            let item = history.record(&prompt, code.as_str(), image.is_some())?;
            println!("Saved {} ({} bytes)", item.id, item.code.len());

            if let Some(path) = output {
                std::fs::write(&path, &code)?;
                println!("Written to {}", path.display());
            }
        }

        Commands::History { clear } => {
            let mut history = history(&config)?;
            if clear {
                history.clear()?;
                println!("History cleared");
            } else {
                for item in history.items() {
                    println!("{}  {}", item.id, item.prompt);
                }
            }
        }
    }

    Ok(())
}

fn loader_config(config: &AppConfig) -> LoaderConfig {
    LoaderConfig {
        user_agent: config.user_agent.clone(),
        ..LoaderConfig::default()
    }
}

/// Build a controller over the disk store for `version` (default: the
/// configured one), resuming the most recently written generation on disk.
async fn controller(
    config: &AppConfig,
    version: Option<String>,
) -> Result<(LifecycleController, mpsc::UnboundedReceiver<LifecycleEvent>)> {
    let storage = DiskCacheStorage::open_dir(config.generations_dir())
        .await
        .context("opening cache store")?;
    let loader = ResourceLoader::new(loader_config(config))?;
    let resumed = latest_generation(&storage).await?;

    let version = version.unwrap_or_else(|| config.cache_version.clone());
    let mut sw_config = SwConfig::new(config.origin_url()?)
        .with_release(Release::new(version, AssetManifest::default()));
    sw_config.skip_waiting_after_install = config.skip_waiting_after_install;

    let (controller, events) =
        LifecycleController::new(sw_config, Arc::new(storage), Arc::new(loader));
    if let Some(resumed) = resumed {
        if controller.resume_from(&resumed).await? {
            println!("Resumed {}", resumed);
        }
    }
    Ok((controller, events))
}

/// The generation holding the most recently captured entry. Activation
/// reaps older ones, so this is the one that was active last.
async fn latest_generation(storage: &DiskCacheStorage) -> Result<Option<GenerationId>> {
    let mut latest: Option<(u64, GenerationId)> = None;
    for generation in storage.generations().await? {
        let handle = CacheHandle::new(generation.clone());
        let mut written = 0;
        for key in storage.keys(&handle).await? {
            if let Some(entry) = storage.get(&handle, &key).await? {
                written = written.max(entry.cached_at);
            }
        }
        if latest.as_ref().map_or(true, |(at, _)| written >= *at) {
            latest = Some((written, generation));
        }
    }
    Ok(latest.map(|(_, generation)| generation))
}

fn history(config: &AppConfig) -> Result<HistoryStore> {
    let storage = LocalStorage::open(config.local_storage_path())?;
    Ok(HistoryStore::load(storage, config.history_key.as_str()))
}

/// Read an image file into a `data:` URL.
fn data_url(path: &Path) -> Result<String> {
    let mime = match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        _ => bail!("unsupported image type: {}", path.display()),
    };
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}

fn print_events(events: &mut mpsc::UnboundedReceiver<LifecycleEvent>) {
    while let Ok(event) = events.try_recv() {
        println!("  event: {:?}", event);
    }
}
