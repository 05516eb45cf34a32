mod cli;

use askdb::config::Config;
use askdb::db::Database;
use askdb::{HttpLlmClient, SchemaDescription, SqlAgent, format, logging};
use clap::Parser;
use cli::Args;
use std::error::Error as StdError;
use std::io::Write;

fn main() -> Result<(), Box<dyn StdError>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async_main());
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));
    result
}

async fn async_main() -> Result<(), Box<dyn StdError>> {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut config = Config::load();
    if let Some(database) = &args.database {
        config.database.path = database.clone();
    }
    if let Some(endpoint) = &args.endpoint {
        config.llm.base_url = endpoint.clone();
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(max_retries) = args.max_retries {
        config.agent.max_retries = max_retries;
    }
    if let Some(row_limit) = args.row_limit {
        config.agent.row_limit = row_limit;
    }
    if let Some(timeout) = args.timeout {
        config.agent.total_timeout_seconds = timeout;
    }
    if args.write {
        config.agent.read_only = false;
    }
    if args.sample_data {
        config.agent.include_sample_data = true;
    }

    if let Err(reason) = config.validate() {
        eprintln!("Configuration error: {reason}");
        std::process::exit(2);
    }

    let db = Database::connect(&config.database.path).await?;

    if args.schema {
        let schema = SchemaDescription::introspect(db.pool()).await?;
        print!("{}", schema.render());
        db.close().await;
        return Ok(());
    }

    let Some(question) = args.question else {
        eprintln!("A question is required (or pass --schema to inspect the database).");
        std::process::exit(2);
    };

    let backend = HttpLlmClient::new(&config.llm)?;
    let agent = SqlAgent::new(config.agent.clone(), db, Box::new(backend));

    let result = agent.run(&question).await;

    println!("SQL:\n{}\n", result.sql);
    if !result.explanation.is_empty() {
        println!("Explanation:\n{}\n", result.explanation);
    }

    if !result.success {
        eprintln!(
            "Query failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
        if !result.attempts.is_empty() {
            eprintln!("Attempts made: {}", result.attempts.len());
            for attempt in &result.attempts {
                eprintln!("  {}: {}", attempt.attempt, attempt.error);
            }
        }
        agent.database().close().await;
        std::process::exit(1);
    }

    print!("{}", format::format_table(&result));
    println!("{}", format::format_row_count(&result));

    if let Some(csv_path) = args.csv {
        let params = format::csv_export_params(&result);
        let target = if csv_path.is_dir() {
            csv_path.join(&params.file_name)
        } else {
            csv_path
        };
        let bytes = format::to_csv(&result)?;
        let mut file = std::fs::File::create(&target)?;
        file.write_all(&bytes)?;
        println!("Exported {} rows to {}", result.row_count, target.display());
    }

    agent.database().close().await;
    Ok(())
}
