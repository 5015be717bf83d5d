use clap::Parser;

use tunnelgrid_node::cli;
use tunnelgrid_node::NodeArgs;

#[tokio::main]
async fn main() {
    let args = NodeArgs::parse();
    if let Err(e) = cli::run(args).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
