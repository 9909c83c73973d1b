mod cli;
mod format;
mod progress;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use harvest_core::commands::{extract, gc, pull};
use harvest_core::config::{resolve_config_path, HarvestConfig};
use harvest_core::hash::ContentHash;
use harvest_core::remote::SshShell;
use harvest_core::store::BlobStore;
use harvest_core::transfer::RsyncTransfer;

use cli::{Cli, Commands};
use format::format_bytes;
use progress::{pull_sink, GcRenderer, PullRenderer};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Some(config_path) = resolve_config_path(cli.config.as_deref()) else {
        eprintln!("Error: no configuration file found.");
        eprintln!("Run with --config <path>, set HARVEST_CONFIG, or create ./harvest.yaml");
        std::process::exit(1);
    };
    let config = match HarvestConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %config_path.display(), "using config");

    let result = match &cli.command {
        Commands::Pull { hostnames } => run_pull(&config, hostnames),
        Commands::Gc => run_gc(&config),
        Commands::Extract { hash, dest } => run_extract(&config, hash, dest),
        Commands::Info => run_info(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run_pull(config: &HarvestConfig, hostnames: &[String]) -> harvest_core::error::Result<()> {
    let shell = SshShell::new(config.scan.clone());
    let transfer = RsyncTransfer::new(
        config.scan.remote_user.clone(),
        Duration::from_secs(config.transfer.timeout_seconds),
    );

    let renderer = Arc::new(Mutex::new(PullRenderer::new()));
    let report = pull::run(
        config,
        &shell,
        &transfer,
        hostnames,
        Some(pull_sink(Arc::clone(&renderer))),
    )?;
    renderer.lock().unwrap_or_else(|e| e.into_inner()).finish();

    for host in &report.reports {
        let mut line = format!(
            "{}: {} entries, {} pulled",
            host.hostname, host.entries, host.committed
        );
        if host.skipped() > 0 {
            line.push_str(&format!(" ({} skipped)", host.skipped()));
        }
        if let Some(e) = &host.transfer_error {
            line.push_str(&format!(" [transfer failed: {e}]"));
        }
        println!("{line}");
    }
    for (host, error) in &report.failed {
        println!("{host}: FAILED — {error}");
    }
    println!("Store size = {}", format_bytes(report.store_bytes));

    if !report.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_gc(config: &HarvestConfig) -> harvest_core::error::Result<()> {
    let mut renderer = GcRenderer::new();
    let mut on_event = |event| renderer.on_event(event);
    let report = gc::run(config, Some(&mut on_event))?;
    println!(
        "Checked {} blobs: {} unreferenced and {} corrupted deleted, {} freed",
        report.blobs_checked,
        report.orphans_deleted,
        report.corrupt_deleted,
        format_bytes(report.orphan_bytes_freed + report.corrupt_bytes_freed)
    );
    Ok(())
}

fn run_extract(config: &HarvestConfig, hash: &str, dest: &str) -> harvest_core::error::Result<()> {
    let hash = ContentHash::parse_hex(hash)?;
    let store = BlobStore::new(config.paths());
    let written = extract::run(&store, &hash, std::path::Path::new(dest))?;
    println!("{}", written.display());
    Ok(())
}

fn run_info(config: &HarvestConfig) -> harvest_core::error::Result<()> {
    let paths = config.paths();
    let store = BlobStore::new(paths.clone());
    println!("root     = {}", paths.root.display());
    println!("hash_dir = {}", paths.hash_dir.display());
    println!("meta_dir = {}", paths.meta_dir.display());
    println!("temp_dir = {}", paths.temp_dir.display());
    println!("size     = {}", format_bytes(store.total_size()?));
    Ok(())
}
