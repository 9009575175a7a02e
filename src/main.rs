use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use covercache::infrastructure::{AppConfig, CliArgs, Command, ConfigStore, ImageCache};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry().with(filter).init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = ConfigStore::resolve(args.config.as_deref())?.load()?;
    config.merge_with_args(args);
    Ok(config)
}

async fn run(cache: &ImageCache, command: Command) -> Result<()> {
    match command {
        Command::Fetch {
            url,
            max_dimension,
            variant,
            output,
        } => {
            let loaded = cache.fetch(&url, max_dimension, variant.as_deref()).await?;
            let (width, height) = loaded.dimensions();
            println!("{}  {width}x{height}  from {}", loaded.key, loaded.source);

            if let Some(path) = output {
                loaded
                    .image
                    .save(&path)
                    .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
            }
            println!("{}", cache.stats().await);
        }
        Command::Remove {
            url,
            max_dimension,
            variant,
        } => {
            cache.remove(&url, max_dimension, variant.as_deref()).await;
            println!(
                "Removed {}",
                ImageCache::key_for(&url, max_dimension, variant.as_deref())
            );
        }
        Command::Clear => {
            cache.clear_all().await;
            println!("Cleared {}", cache.cache_dir().display());
        }
        Command::Key {
            url,
            max_dimension,
            variant,
        } => {
            let key = ImageCache::key_for(&url, max_dimension, variant.as_deref());
            let presence = cache.tiers(&url, max_dimension, variant.as_deref()).await;
            println!(
                "{key}  {}  {}",
                cache.disk_path(&key).display(),
                if presence.disk { "cached" } else { "absent" }
            );
        }
        Command::Prefetch {
            urls,
            max_dimension,
        } => {
            let total = urls.len();
            let loaded = cache.prefetch(urls, max_dimension).await?;
            println!("Prefetched {loaded}/{total}");

            let usage = cache.disk_usage().await;
            println!("Disk: {} files, {} bytes", usage.files, usage.bytes);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    init_logging(&config)?;

    info!(version = covercache::VERSION, "Starting covercache");

    let cache = ImageCache::with_http(config.cache)?;
    run(&cache, args.command).await?;
    cache.flush().await;

    Ok(())
}
