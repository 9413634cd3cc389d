use std::collections::HashMap;
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use grainkv::config::Layered;
use grainkv::{derive_key, EnvSource, GrainFields, GrainId, GrainKey, GrainStorage};
use serde_json::Value;

/// Inspect and edit grain state stored in a grainkv bucket.
///
/// Options not given with `-o` are read from `GRAINKV_*` environment
/// variables, e.g. `GRAINKV_SERVER_ADDRESSES`.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Provider option as KEY=VALUE, e.g. -o BucketName=grains
    #[arg(short = 'o', long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Print the storage key for a grain
    Key { grain_type: String, grain_key: GrainKey },
    /// Print a grain's stored fields
    Read { grain_type: String, grain_key: GrainKey },
    /// Replace a grain's stored fields with a JSON object
    Write { grain_type: String, grain_key: GrainKey, state: String },
    /// Delete a grain's stored state
    Clear { grain_type: String, grain_key: GrainKey },
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Commands::Key { grain_type, grain_key } = &cli.command {
        println!("{}", derive_key(&GrainId::new(grain_type.clone(), grain_key.clone())));
        return Ok(());
    }

    let overrides: HashMap<String, String> = cli.options.into_iter().collect();
    let config = Layered::new().with(overrides).with(EnvSource::default());

    let storage = GrainStorage::new();
    storage.init("grainkv-cli", &config).await.context("cannot open storage")?;

    let result = run(&storage, cli.command).await;
    storage.close().await;
    result
}

async fn run(storage: &GrainStorage, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Key { .. } => {}
        Commands::Read { grain_type, grain_key } => {
            let id = GrainId::new(grain_type.clone(), grain_key);
            let mut fields = GrainFields::new();
            if storage.read_state(&grain_type, &id, &mut fields).await? {
                println!("{}", serde_json::to_string_pretty(&fields)?);
            } else {
                eprintln!("no stored state for {}", id);
            }
        }
        Commands::Write { grain_type, grain_key, state } => {
            let id = GrainId::new(grain_type.clone(), grain_key);
            let fields = match serde_json::from_str(&state).context("state is not valid JSON")? {
                Value::Object(fields) => fields,
                _ => return Err(anyhow!("state must be a JSON object")),
            };
            storage.write_state(&grain_type, &id, &fields).await?;
            println!("OK");
        }
        Commands::Clear { grain_type, grain_key } => {
            storage.clear_state(&grain_type, &GrainId::new(grain_type.clone(), grain_key)).await?;
            println!("OK");
        }
    }
    Ok(())
}
