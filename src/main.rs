use anyhow::Result;
use tracing::{error, info};

mod browser;
mod cli;
mod coordinator;
mod error;
mod extraction;
mod messaging;
mod storage;
mod utils;
mod worker;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    utils::init_logging(args.verbose, args.log_file.clone())?;

    info!("Starting paged-scraper v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
