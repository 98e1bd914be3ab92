use clap::Parser;
use std::process;
use vaflow_service::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(err) = vaflow_service::run(cli) {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}
