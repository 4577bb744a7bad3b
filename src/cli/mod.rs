pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use self::config::ServiceConfig;
use crate::storage::SortOrder;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration profile to use instead of the default
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scraping worker that consumes tasks
    Worker,

    /// Run the result consumer that applies results to the store
    Consumer,

    /// Create a task and enqueue it
    Submit {
        /// Base URL to scrape
        #[arg(required = true)]
        url: String,

        /// Extraction config file (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Kind of data being extracted
        #[arg(short, long, default_value = "generic")]
        data_type: String,

        /// Maximum pages per label
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },

    /// Check status of a task
    Status {
        #[arg(required = true)]
        task_id: Uuid,
    },

    /// Print the extracted items of a task
    Items {
        #[arg(required = true)]
        task_id: Uuid,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Search extracted items across tasks
    Search {
        /// Only items of tasks with this data type
        #[arg(short, long)]
        data_type: Option<String>,

        /// Item field that must equal a value, as FIELD=VALUE (repeatable; VALUE may be JSON)
        #[arg(short, long = "filter", value_name = "FIELD=VALUE")]
        filters: Vec<String>,

        /// Item field to sort by; creation time when omitted
        #[arg(long)]
        sort_field: Option<String>,

        /// asc or desc
        #[arg(long, default_value = "desc")]
        sort_order: SortOrder,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to show or create
        #[arg(required = false)]
        name: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

fn load_config(profile: Option<&str>) -> Result<ServiceConfig> {
    match profile {
        Some(name) => ServiceConfig::load_profile(name),
        None => ServiceConfig::load_default(),
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Worker => commands::worker(load_config(profile)?).await,
        Commands::Consumer => commands::consumer(load_config(profile)?).await,
        Commands::Submit {
            url,
            config,
            data_type,
            pages,
        } => {
            info!("Submitting task for {}", url);
            commands::submit(load_config(profile)?, url, config, data_type, pages).await
        }
        Commands::Status { task_id } => {
            info!("Checking status for task {}", task_id);
            commands::status(load_config(profile)?, task_id).await
        }
        Commands::Items { task_id, page, limit } => {
            commands::items(load_config(profile)?, task_id, page, limit).await
        }
        Commands::Search {
            data_type,
            filters,
            sort_field,
            sort_order,
            page,
            limit,
        } => {
            let query = commands::item_query(data_type, &filters, sort_field, sort_order, page, limit)?;
            commands::search(load_config(profile)?, query).await
        }
        Commands::Config { name, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = name {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config(&load_config(profile)?)
            }
        }
    }
}
