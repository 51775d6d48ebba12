use anyhow::Result;
use kaudit::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    kaudit::init_logger(options.override_log_level());

    match kaudit::listener::kaudit_run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
