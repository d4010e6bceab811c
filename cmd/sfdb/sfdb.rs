mod cli;

use bytes::Bytes;
use clap::Parser;
use cli::{parse_key, parse_request, Cli, Command};
use sfdb_catalogue::Engine;
use sfdb_common::{Config, FdbError};
use sfdb_remote::Server;
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(FdbError::Usage(msg)) => {
            error!("usage: {msg}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, FdbError> {
    match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

async fn run(cli: Cli) -> Result<(), FdbError> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Server { port } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            let schema = config.load_schema()?;
            let running = Server::new(config, schema)
                .bind()
                .await
                .map_err(FdbError::from)?;
            info!(endpoint = %running.endpoint(), "serving; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            running.shutdown();
            Ok(())
        }
        Command::Archive { key, input } => {
            let key = parse_key(&key)?;
            let data = std::fs::read(&input)?;
            let mut engine = Engine::new(config)?;
            engine.archive(&key, Bytes::from(data)).await?;
            engine.flush().await?;
            engine.close().await
        }
        Command::Retrieve { key, output } => {
            let key = parse_key(&key)?;
            let mut engine = Engine::new(config)?;
            let bytes = engine
                .retrieve(&key)
                .await?
                .read_all()
                .await
                .map_err(FdbError::from)?;
            match output {
                Some(path) => std::fs::write(path, &bytes)?,
                None => std::io::stdout().write_all(&bytes)?,
            }
            Ok(())
        }
        Command::List { request, dedup } => {
            let request = parse_request("list", &request)?;
            let engine = Engine::new(config)?;
            for element in engine.list(&request, dedup).await? {
                println!("{} -> {}", element.key, element.location);
            }
            Ok(())
        }
        Command::Dump { request } => {
            let request = parse_request("dump", &request)?;
            let engine = Engine::new(config)?;
            print!("{}", engine.dump(&request).await?);
            Ok(())
        }
        Command::Stats { request } => {
            let request = parse_request("stats", &request)?;
            let engine = Engine::new(config)?;
            let stats = engine.stats(&request).await?;
            println!("databases:   {}", stats.databases);
            println!("indexes:     {}", stats.indexes);
            println!("fields:      {}", stats.fields);
            println!("field bytes: {}", stats.field_bytes);
            Ok(())
        }
        Command::Status { request } => {
            let request = parse_request("status", &request)?;
            let engine = Engine::new(config)?;
            for (db, disabled) in engine.status(&request).await?.databases {
                println!("{db}: {disabled}");
            }
            Ok(())
        }
        Command::Purge { request, doit } => {
            let request = parse_request("purge", &request)?;
            let mut engine = Engine::new(config)?;
            let report = engine.purge(&request, doit).await?;
            println!("duplicate fields: {}", report.duplicate_fields);
            println!("maskable epochs:  {}", report.maskable.len());
            println!("removable units:  {}", report.removable_units.len());
            if !doit {
                println!("rerun with --doit to apply");
            }
            engine.close().await
        }
        Command::Wipe {
            request,
            doit,
            unsafe_wipe_all,
        } => {
            let request = parse_request("wipe", &request)?;
            if request.is_empty() {
                return Err(FdbError::usage(
                    "refusing an unconstrained wipe; name at least one keyword",
                ));
            }
            let mut engine = Engine::new(config)?;
            let results = engine.wipe(&request, doit, unsafe_wipe_all).await?;
            for (db, plan) in results {
                println!("{db}:");
                println!("  delete units:  {}", plan.delete_units.len());
                println!("  safe units:    {}", plan.safe_units.len());
                println!("  mask epochs:   {}", plan.mask_entries.len());
                println!("  rewrite epochs:{}", plan.rewrite_epochs.len());
                println!("  full wipe:     {}", plan.full);
                if !plan.residuals.is_empty() {
                    println!("  residuals:     {}", plan.residuals.len());
                }
            }
            if !doit {
                println!("rerun with --doit to apply");
            }
            engine.close().await
        }
    }
}
