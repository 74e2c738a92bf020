mod settings;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;

use vidsquash_core::shared::progress::LogProgressSink;
use vidsquash_core::shared::source_asset::SourceAsset;
use vidsquash_core::transcode::compress_options::CompressOptions;
use vidsquash_core::transcode::compressor::Compressor;

use settings::Settings;

/// Re-encode a video to an H.264/AAC MP4.
#[derive(Parser)]
#[command(name = "vidsquash")]
struct Cli {
    /// Input video: a file path, file:// URI or http(s) URL.
    input: String,

    /// Directory for the compressed file (default: saved setting or current directory).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Target video bitrate in bits per second.
    #[arg(long)]
    bitrate: Option<u64>,

    /// Identifier echoed in progress output.
    #[arg(long)]
    id: Option<String>,

    /// Store the effective bitrate and output directory as new defaults.
    #[arg(long)]
    save_settings: bool,
}

/// Flags layered over the saved settings.
struct Effective {
    asset: SourceAsset,
    output_dir: PathBuf,
    bitrate: u64,
}

fn main() {
    // Progress is logged at info, so show it unless RUST_LOG says otherwise.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = Settings::load();
    let effective = resolve(&cli, &settings);
    validate(&effective)?;

    if cli.save_settings {
        let saved = Settings {
            bitrate: effective.bitrate,
            output_dir: Some(effective.output_dir.clone()),
        };
        let path = saved.save()?;
        log::info!("Saved settings to {}", path.display());
    }

    let mut options = CompressOptions::default()
        .with_bitrate(effective.bitrate)
        .with_progress(Arc::new(LogProgressSink::default()));
    options.identifier = cli.id;

    let compressor = Compressor::with_ffmpeg(&effective.output_dir);
    let output = compressor.compress(&effective.asset, options)?;
    log::info!("Wrote {}", output.display());
    println!("{}", output.display());
    Ok(())
}

fn resolve(cli: &Cli, settings: &Settings) -> Effective {
    Effective {
        asset: SourceAsset::parse(&cli.input),
        output_dir: cli
            .output_dir
            .clone()
            .or_else(|| settings.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
        bitrate: cli.bitrate.unwrap_or(settings.bitrate),
    }
}

fn validate(effective: &Effective) -> Result<(), Box<dyn std::error::Error>> {
    if let SourceAsset::File(path) = &effective.asset {
        if !path.exists() {
            return Err(format!("Input file not found: {}", path.display()).into());
        }
    }
    if effective.bitrate == 0 {
        return Err("Bitrate must be greater than 0".into());
    }
    if !is_dir(&effective.output_dir) {
        return Err(format!(
            "Output directory not found: {}",
            effective.output_dir.display()
        )
        .into());
    }
    Ok(())
}

fn is_dir(path: &Path) -> bool {
    path.metadata().map(|m| m.is_dir()).unwrap_or(false)
}
