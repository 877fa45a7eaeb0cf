//! Fleet loop CLI entry point.

use clap::Parser;

use fleet_loop::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(err) = fleet_loop::cli::execute(cli).await {
        fleet_loop::cli::handle_error(err, json);
    }
}
