use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use bookforge_common::ConversionKind;

#[derive(Parser)]
#[command(name = "bookforge")]
#[command(author, version, about = "Audiobook conversion with tracked background jobs")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Conversion kind as spelled on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    /// Single decrypted M4B
    Full,
    /// One MP3 per chapter, zipped
    Chapters,
}

impl From<KindArg> for ConversionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Full => ConversionKind::FullConvert,
            KindArg::Chapters => ConversionKind::ChapteredConvert,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert an AAX file and follow its progress
    Convert {
        /// Input file to convert
        #[arg(required = true)]
        input: PathBuf,

        /// Activation bytes for decryption (hex)
        #[arg(long)]
        activation_bytes: String,

        /// What to produce
        #[arg(long, value_enum, default_value = "full")]
        kind: KindArg,

        /// Override the configured output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Show the status of a conversion
    Status {
        /// Subject (input file name)
        subject: String,

        #[arg(long, value_enum, default_value = "full")]
        kind: KindArg,
    },

    /// List active conversions
    List,

    /// Run distributed fan-out queue workers until interrupted
    Worker,

    /// Fail stale in-flight jobs and delete expired records
    Sweep,

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
