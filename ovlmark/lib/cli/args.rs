use std::path::PathBuf;

use super::styles;
use clap::Parser;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// ovlmark converts aufs whiteouts in a layer directory into overlayfs whiteouts
#[derive(Debug, Parser)]
#[command(name = "ovlmark", author, styles=styles::styles())]
pub struct OvlmarkArgs {
    /// Layer directory to convert in place
    #[arg()]
    pub dir: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'V', long)]
    pub verbose: bool,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl OvlmarkArgs {
    /// The log filter used when `RUST_LOG` is not set.
    pub fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
