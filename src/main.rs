use std::process::ExitCode;

use clap::Parser as _;
use codedock::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    codedock::init_logging(cli.verbose);

    match codedock::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
