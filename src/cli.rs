//! Command-line argument parsing for toolrelay

use clap::Parser;
use std::path::PathBuf;

/// toolrelay - Runs hosted-assistant conversations and executes their tool calls locally
#[derive(Parser, Debug)]
#[command(name = "toolrelay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Address to listen on (overrides server.bind)
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Print the registered tool declarations as JSON and exit
    #[arg(long)]
    pub list_tools: bool,
}
