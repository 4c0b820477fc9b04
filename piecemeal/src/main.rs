use std::process::ExitCode;

use clap::Parser;

use piecemeal::{App, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let mut app = match App::new(Cli::parse()) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("{:?}", err);
            return ExitCode::FAILURE;
        }
    };
    match app.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::FAILURE
        }
    }
}
