use clap::Parser;
use ovlmark::{cli::OvlmarkArgs, OvlmarkResult};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

fn main() -> OvlmarkResult<()> {
    // Parse command line arguments
    let args = OvlmarkArgs::parse();

    // RUST_LOG takes precedence over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_log_level()));
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    tracing::debug!("converting layer: dir={}", args.dir.display());
    let stats = ovlmark::convert(&args.dir)?;
    tracing::info!(
        "converted {}: whiteouts={}, opaque_dirs={}, directories={}, skipped_mounts={}, unreadable_dirs={}",
        args.dir.display(),
        stats.get_whiteouts(),
        stats.get_opaque_dirs(),
        stats.get_directories(),
        stats.get_skipped_mounts(),
        stats.get_unreadable_dirs(),
    );

    Ok(())
}
