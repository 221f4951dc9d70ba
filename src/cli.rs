//! CLI argument parsing for carrera

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Output format for race reports
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "carrera")]
#[command(version)]
#[command(about = "Static data race detector for pthread/OpenMP programs", long_about = None)]
pub struct Cli {
    /// Normalized program module (JSON) to analyze
    pub program: PathBuf,

    /// Entry function to root the trace at
    #[arg(long, default_value = "main")]
    pub entry: String,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print the symbolic program trace before analysis
    #[arg(long = "print-trace")]
    pub print_trace: bool,

    /// Print function coverage statistics after analysis
    #[arg(long)]
    pub coverage: bool,

    /// Only report races whose locations match this regex
    #[arg(short = 'e', long = "expr", value_name = "REGEX")]
    pub filter: Option<String>,

    /// Enable debug logging to stderr
    #[arg(long)]
    pub debug: bool,
}
