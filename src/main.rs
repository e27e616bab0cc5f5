use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::fs::File;
use tokio::io::BufWriter;
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comtiles::{ArchiveWriter, MbtilesSource};

#[derive(Parser)]
#[command(
    name = "comtiles-convert",
    about = "Convert an MBTiles database into a COMTiles archive",
    version
)]
struct Cli {
    /// Path of the source MBTiles database
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Path of the COMTiles archive to create
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Highest zoom stored in the always-loaded pyramid index
    #[arg(short = 'z', long = "pyramidMaxZoom", default_value_t = 7)]
    pyramid_max_zoom: u8,

    /// Highest zoom read with one database query per zoom; above it the
    /// database is queried one fragment window at a time
    #[arg(short = 'm', long = "maxZoomDbQuery", default_value_t = 8)]
    max_zoom_db_query: u8,

    /// Set the logging level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(Level::from(cli.log_level).as_str())
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (mut source, metadata) =
        MbtilesSource::open(&cli.input, cli.pyramid_max_zoom, cli.max_zoom_db_query)?;
    info!(
        input = %cli.input.display(),
        name = %metadata.name,
        zooms = metadata.tile_matrix_set.tile_matrix.len(),
        "read tile matrix set"
    );

    let writer = ArchiveWriter::new(metadata)?;
    let file = File::create(&cli.output).await?;
    let mut output = BufWriter::new(file);
    let summary = writer.write(&mut source, &mut output).await?;

    info!(
        output = %cli.output.display(),
        tiles = summary.tiles_written,
        missing = summary.tiles_missing,
        pyramid_bytes = summary.pyramid_length,
        fragment_bytes = summary.fragments_length,
        data_bytes = summary.data_length,
        "archive written"
    );
    Ok(())
}
