use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const DEFAULT_CONFIG: &str = "switchyard.toml";

/// Switchyard LLM gateway
#[derive(Debug, Parser)]
#[command(
    name = "switchyard",
    about = "One chat API over local, OpenAI, Gemini, WebLLM and cloud models"
)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG, env = "SWITCHYARD_CONFIG", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP gateway and the WebLLM bridge
    Serve {
        /// Override the listen address
        #[arg(long, env = "SWITCHYARD_LISTEN")]
        listen: Option<SocketAddr>,
    },
    /// Send a single prompt and print the answer
    Chat {
        /// Model to use; the configured default applies when omitted
        #[arg(short, long)]
        model: Option<String>,

        /// System prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,

        prompt: String,
    },
}
