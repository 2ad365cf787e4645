use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod app;
mod cli;
mod config;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::App;
use config::Config;
use semantic::{Granularity, SearchOptions};

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    init_tracing(args.debug);

    let config = Config::load_with(&args.data_dir)?;
    let app = App::new(config)?;

    match args.command {
        cli::Command::Serve { port } => web::start_daemon(app, port),

        cli::Command::Search {
            query,
            book,
            chapter,
            verse,
            granularity,
            k,
        } => {
            let (text, inline) = semantic::query::parse_query(&query);
            let options = SearchOptions {
                book: semantic::query::coalesce([book.as_deref(), inline.book.as_deref()]),
                chapter: semantic::query::coalesce([chapter.as_deref(), inline.chapter.as_deref()]),
                verse: semantic::query::coalesce([verse.as_deref(), inline.verse.as_deref()]),
                granularity,
                k,
            };

            app.start_model();
            app.service().preload(granularity)?;
            app.wait_for_model();

            let results = app.service().search(&text, &options)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }

        cli::Command::Embed { text, document } => {
            app.start_model();
            // the precomputed provider draws on verse data
            if let Err(e) = app.service().preload(Granularity::Verse) {
                log::warn!("verse corpus unavailable, embedding without it: {e}");
            }
            app.wait_for_model();

            let chain = app.service().chain();
            let embedding = if document {
                chain.embed_document(&text)?
            } else {
                chain.embed_query(&text)?
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "embedding": embedding,
                    "dimensions": embedding.len(),
                }))?
            );
            Ok(())
        }

        cli::Command::Status {} => {
            app.preload_all()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "initialized": true,
                    "indices": app.service().status(),
                }))?
            );
            Ok(())
        }
    }
}
