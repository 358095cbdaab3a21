//! Binary entry point: install the error reporter, wire verbosity to the
//! tracing subscriber, and dispatch the subcommand.

use clap::Parser;
use color_eyre::eyre::Result;

use bayaudit::app;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = app::Cli::parse();

    let level = match cli.verbose.log_level_filter() {
        log::LevelFilter::Off => None,
        log::LevelFilter::Error => Some(tracing::Level::ERROR),
        log::LevelFilter::Warn => Some(tracing::Level::WARN),
        log::LevelFilter::Info => Some(tracing::Level::INFO),
        log::LevelFilter::Debug => Some(tracing::Level::DEBUG),
        log::LevelFilter::Trace => Some(tracing::Level::TRACE),
    };
    if let Some(level) = level {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }

    app::actual(cli)
}
