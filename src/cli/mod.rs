use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::tools::TOOL_CONF_ENV;

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware volume view, extract and rebuild", long_about = None)]
pub struct Args {
    /// Extra GUID tool definitions, one `<guid> <name> <path>` per line. Falls back to FMMT_TOOL_CONF.
    #[arg(long, global = true)]
    pub tool_conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Print the volumes, nested volumes and named files of an image.
    #[command(alias = "v")]
    View {
        /// The firmware image (a whole flash device or a single volume).
        #[arg(required = true)]
        image: PathBuf,

        /// Print a JSON report instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Decompose every volume and write its leaf files to a directory.
    #[command(alias = "x")]
    Extract {
        /// The firmware image to decompose.
        #[arg(required = true)]
        image: PathBuf,

        /// The directory that receives the leaf files.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Decompose one volume and rebuild it with GenFv/GenFfs/GenSec.
    #[command(alias = "r")]
    Rebuild {
        /// The firmware image holding the volume.
        #[arg(required = true)]
        image: PathBuf,

        /// Name of the volume as printed by `view` (e.g. FV0).
        #[arg(required = true)]
        volume: String,

        /// Where to write the image with the rebuilt volume in place.
        #[arg(short, long)]
        output: PathBuf,

        /// Directory for leaf and intermediate files. A temporary one is used if omitted.
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
}

/// Gets the tool definition file from the command-line option or the `FMMT_TOOL_CONF`
/// environment variable, in that order.
pub fn tool_conf_from_opt_or_env(opt: Option<PathBuf>) -> Option<PathBuf> {
    opt.or_else(|| std::env::var_os(TOOL_CONF_ENV).map(PathBuf::from))
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Result<Args, Box<dyn std::error::Error>> {
    Ok(Args::parse())
}
