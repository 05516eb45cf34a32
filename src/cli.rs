use clap::Parser;
use std::path::PathBuf;

/// askdb - ask a SQLite database questions in plain language
#[derive(Parser, Debug, Clone)]
#[command(name = "askdb")]
#[command(version, long_about = None)]
#[command(about = "Translate a natural-language question into SQL, run it, explain it")]
pub struct Args {
    /// The question to answer
    ///
    /// Examples:
    ///   askdb "Show me the top 5 customers by total order amount"
    ///   askdb -d shop.db "Which customers have not placed any orders?"
    #[arg(value_name = "QUESTION")]
    pub question: Option<String>,

    /// Path to the SQLite database file
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<String>,

    /// Base URL of the model endpoint (any OpenAI-compatible server)
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Model identifier as known to the endpoint
    #[arg(short, long, value_name = "NAME")]
    pub model: Option<String>,

    /// Re-prompt attempts after a failed generation
    #[arg(long, value_name = "N")]
    pub max_retries: Option<usize>,

    /// Maximum number of result rows to fetch
    #[arg(long, value_name = "N")]
    pub row_limit: Option<usize>,

    /// Wall-clock budget for the whole question, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Write the result rows to a CSV file (or into a directory)
    #[arg(long, value_name = "PATH")]
    pub csv: Option<PathBuf>,

    /// Print the introspected schema and exit
    #[arg(long)]
    pub schema: bool,

    /// Allow data-modifying statements (INSERT/UPDATE/DELETE)
    #[arg(long)]
    pub write: bool,

    /// Include sample rows in the prompt (sends data to the model endpoint)
    #[arg(long)]
    pub sample_data: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
