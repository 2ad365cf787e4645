use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::semantic::Granularity;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml, cached payloads and models
    #[clap(long, global = true, env = "SCRIPTURE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[clap(long, global = true, default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP search service.
    Serve {
        #[clap(short, long, default_value = "8080", env = "PORT")]
        port: u16,
    },
    /// Search passages from the command line
    Search {
        /// Query text; may contain book:, chapter: and verse: filters
        #[clap(allow_hyphen_values = true)]
        query: String,

        /// Book name (case-insensitive)
        #[clap(short, long)]
        book: Option<String>,

        /// Chapter number
        #[clap(short, long)]
        chapter: Option<String>,

        /// Verse number (verse granularity only)
        #[clap(short, long)]
        verse: Option<String>,

        #[clap(short, long, default_value = "verse")]
        granularity: Granularity,

        /// Number of results
        #[clap(short, default_value = "10")]
        k: usize,
    },
    /// Print the embedding vector for a text
    Embed {
        text: String,

        /// Embed as a passage instead of a query
        #[clap(long, default_value = "false")]
        document: bool,
    },
    /// Load every granularity and print index status
    Status {},
}

impl clap::ValueEnum for Granularity {
    fn value_variants<'a>() -> &'a [Self] {
        &Granularity::ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}
