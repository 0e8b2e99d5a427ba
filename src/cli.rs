//! Command-line interface for kaiwa
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Voice conversation engine for animated LLM personas
#[derive(Parser, Debug)]
#[command(name = "kaiwa", version, about = "Voice conversations with an LLM persona")]
pub struct Cli {
    /// Subcommand to execute (default: interactive chat)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: info, -vv: debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Use the local completion endpoint instead of the hosted one
    #[arg(long)]
    pub local: bool,

    /// Language code for transcription (e.g. en, ru, ja)
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synthesize text to speech and write the audio to a file
    Say {
        /// Text to speak
        text: String,

        /// Output file for the audio bytes
        #[arg(short, long, value_name = "PATH", default_value = "out.mp3")]
        output: PathBuf,
    },

    /// Translate text using the configured completion model
    Translate {
        /// Text to translate
        text: String,

        /// Target language
        #[arg(short, long, value_name = "LANG", default_value = "English")]
        to: String,
    },

    /// Manage configuration
    Config {
        /// Action to perform
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the config file path
    Path,

    /// Print the effective configuration as TOML
    Show,
}
