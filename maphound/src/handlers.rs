use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use maphound_core::report::render_report;
use maphound_core::ReportFormat;
use maphound_crawler::{
    ApiProxySupplier, BoundingBox, CheckpointStore, CrawlOptions, Crawler, HtmlCardExtractor,
    PoolConfig, ProgressCallback, ProxiedFetcher, ProxyPool,
};

// Helper functions for the crawl handler

/// Parse a bounding box given as "NE_LAT,NE_LNG,SW_LAT,SW_LNG".
pub fn parse_bbox(raw: &str) -> Result<BoundingBox, String> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a coordinate", part.trim()))
        })
        .collect::<Result<_, _>>()?;

    if parts.len() != 4 {
        return Err(format!(
            "expected 4 comma-separated coordinates, got {}",
            parts.len()
        ));
    }

    let bbox = BoundingBox::new(parts[0], parts[1], parts[2], parts[3]);
    if bbox.ne_lat <= bbox.sw_lat || bbox.ne_lng <= bbox.sw_lng {
        return Err("the north-east corner must lie north-east of the south-west corner".to_string());
    }
    Ok(bbox)
}

/// Resolve the proxy supplier endpoint from arguments or the environment.
pub fn proxy_api_config(args: &ArgMatches) -> Result<(String, String), String> {
    let url = args
        .get_one::<String>("proxy-api")
        .cloned()
        .or_else(|| std::env::var("MAPHOUND_PROXY_API").ok());
    let key = args
        .get_one::<String>("proxy-api-key")
        .cloned()
        .or_else(|| std::env::var("MAPHOUND_PROXY_API_KEY").ok());

    match (url, key) {
        (Some(url), Some(key)) => Ok((url, key)),
        _ => Err(
            "proxy supplier not configured: pass --proxy-api and --proxy-api-key, or set \
             MAPHOUND_PROXY_API and MAPHOUND_PROXY_API_KEY"
                .to_string(),
        ),
    }
}

pub async fn handle_crawl(args: &ArgMatches) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let grid_size = *args.get_one::<usize>("grid-size").unwrap();
    let zoom = *args.get_one::<u8>("zoom").unwrap();
    let max_results = *args.get_one::<usize>("max-results").unwrap();
    let threads = *args.get_one::<usize>("threads").unwrap();
    let resume = args.get_flag("resume");
    let checkpoint_path = args.get_one::<PathBuf>("checkpoint").unwrap().clone();
    let platform = args.get_one::<String>("platform").unwrap().clone();

    let bounding_box = match args.get_one::<String>("bbox") {
        Some(raw) => match parse_bbox(raw) {
            Ok(bbox) => bbox,
            Err(e) => {
                eprintln!("{} Invalid --bbox: {}", "✗".red().bold(), e);
                return 1;
            }
        },
        None => BoundingBox::default(),
    };

    let (api_url, api_key) = match proxy_api_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return 1;
        }
    };

    let format = args
        .get_one::<String>("format")
        .and_then(|raw| ReportFormat::from_str(raw))
        .unwrap_or(ReportFormat::Text);
    let output = args.get_one::<PathBuf>("output").cloned();

    let mut options = CrawlOptions {
        platform,
        bounding_box,
        grid_size,
        zoom,
        concurrency: threads,
        checkpoint_path,
        resume,
        ..Default::default()
    };
    if let Some(template) = args.get_one::<String>("search-url") {
        options.search_url = template.clone();
    }

    println!("🗺  Sweeping {}x{} probes at zoom {}", grid_size, grid_size, zoom);
    println!("Platform: {}", options.platform);
    println!(
        "Checkpoint: {}{}\n",
        options.checkpoint_path.display(),
        if resume { " (resuming)" } else { "" }
    );

    let supplier = ApiProxySupplier::new(api_url, api_key);
    let pool = ProxyPool::new(Box::new(supplier), PoolConfig::default());
    let fetcher = Arc::new(ProxiedFetcher::default());
    let extractor = Arc::new(HtmlCardExtractor::new(max_results));

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    progress_bar.enable_steady_tick(Duration::from_millis(100));
    progress_bar.set_message("Starting crawl...");

    let bar = progress_bar.clone();
    let progress: ProgressCallback = Arc::new(move |message: String| {
        bar.set_message(message);
    });

    let mut crawler = Crawler::new(options, pool, fetcher, extractor)
        .with_progress_callback(progress);

    match crawler.run().await {
        Ok(summary) => {
            progress_bar.finish_and_clear();
            let report = render_report(&summary, &format);
            match output {
                Some(path) => {
                    if let Err(e) = write_report(&path, &report) {
                        eprintln!("{} {}", "✗".red().bold(), e);
                        return 1;
                    }
                    println!("Report saved to {}", path.display());
                }
                None => println!("{report}"),
            }
            if summary.completed_cleanly() {
                0
            } else {
                // distinct exit status for quota/ban exhaustion
                2
            }
        }
        Err(e) => {
            progress_bar.finish_and_clear();
            eprintln!("{} Crawl failed: {}", "✗".red().bold(), e);
            1
        }
    }
}

fn write_report(path: &PathBuf, report: &str) -> anyhow::Result<()> {
    std::fs::write(path, report)
        .with_context(|| format!("failed to write report to {}", path.display()))
}

pub fn handle_checkpoint_show(args: &ArgMatches) {
    let path = args.get_one::<PathBuf>("checkpoint").unwrap();
    let store = CheckpointStore::new(path.clone());
    let checkpoint = store.load();

    println!("Checkpoint: {}", path.display());
    println!("  schema version:   {}", checkpoint.version);
    println!("  completed probes: {}", checkpoint.completed_probes.len());
    println!("  seen result ids:  {}", checkpoint.seen_result_ids.len());
}

pub fn handle_checkpoint_clear(args: &ArgMatches) {
    let path = args.get_one::<PathBuf>("checkpoint").unwrap();
    let store = CheckpointStore::new(path.clone());
    match store.clear() {
        Ok(()) => println!("{} Checkpoint cleared: {}", "✓".green().bold(), path.display()),
        Err(e) => {
            eprintln!("{} Failed to clear checkpoint: {}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    }
}
