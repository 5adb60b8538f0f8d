use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use wavin_ahc_tools::commands;

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Repair(commands::repair::Args),
    Suggest(commands::suggest::Args),
    Run(commands::run::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter = std::env::var("WAVIN_AHC_TOOLS_LOG")
        .ok()
        .and_then(|description| {
            description.parse::<tracing_subscriber::filter::targets::Targets>().ok()
        })
        .unwrap_or_else(|| {
            tracing_subscriber::filter::targets::Targets::new()
                .with_default(tracing::level_filters::LevelFilter::INFO)
        });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Repair(args) => end(commands::repair::run(args)),
        Commands::Suggest(args) => end(commands::suggest::run(args)),
        Commands::Run(args) => end(commands::run::run(args)),
    }
}
