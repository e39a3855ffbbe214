use anyhow::Context;
use bytes::BytesMut;
use colored::Colorize;
use futures::stream::{self, StreamExt};
use taric_commit::{PublishRequest, UploadBody};
use taric_crypto::generate_api_key;
use taric_index::{IndexEntry, RebuildMode, RebuildReport};
use taric_server::{open_backend, AppState, ServerConfig, TaricServer};
use taric_types::DeltaDate;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        config,
        format,
        overrides,
        ..
    } = cli;

    let load = move || load_config(config, overrides);
    match command {
        Command::Serve(args) => cmd_serve(load()?, args).await,
        Command::RebuildIndex(args) => cmd_rebuild(&load()?, args, &format).await,
        Command::Upload(args) => cmd_upload(&load()?, args, &format).await,
        Command::Remove(args) => cmd_remove(&load()?, args).await,
        Command::Deltas(args) => cmd_deltas(&load()?, args, &format).await,
        Command::GenerateApiKey(args) => cmd_generate_api_key(args, &format),
    }
}

/// File (if any), then flag and environment overrides.
pub fn load_config(
    path: Option<std::path::PathBuf>,
    overrides: ConfigOverrides,
) -> anyhow::Result<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn open_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let backend = open_backend(&config.backend, config.chunk_size).await?;
    Ok(AppState::build(backend, config)?)
}

async fn cmd_serve(mut config: ServerConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if config.api_keys.is_empty() {
        warn!("no read api keys configured, every read request will be refused");
    }
    if config.api_keys_upload.is_empty() {
        warn!("no upload api keys configured, every write request will be refused");
    }
    TaricServer::new(config).serve().await?;
    Ok(())
}

async fn cmd_rebuild(config: &ServerConfig, args: RebuildArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let state = open_state(config).await?;
    let mode = if args.if_missing {
        RebuildMode::IfMissing
    } else {
        RebuildMode::Forced
    };
    let report = state.reconciler().rebuild(mode).await?;
    match format {
        OutputFormat::Json => println!("{}", report_json(&report)),
        OutputFormat::Text if report.skipped => {
            println!("Index {} already present, nothing to do.", state.index().key().bold());
        }
        OutputFormat::Text => {
            println!("{} Index rebuilt", "✓".green().bold());
            println!("  Indexed: {}", report.indexed.to_string().bold());
            println!("  Purged:  {}", report.purged);
            if report.ignored > 0 {
                println!("  Ignored: {}", report.ignored.to_string().yellow());
            }
            if report.vanished > 0 {
                println!("  Vanished during scan: {}", report.vanished.to_string().yellow());
            }
            if report.swept > 0 {
                println!("  Staging leftovers swept: {}", report.swept);
            }
        }
    }
    Ok(())
}

async fn cmd_upload(config: &ServerConfig, args: UploadArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let state = open_state(config).await?;

    let mut request = PublishRequest::streaming(args.seq, file_body(file, config.chunk_size));
    if let Some(modtime) = args.modtime {
        request = request.with_modtime(modtime);
    }
    let receipt = state.protocol().publish(request).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&receipt.entry)?),
        OutputFormat::Text => {
            let verb = if receipt.replaced { "Replaced" } else { "Published" };
            println!("{} {} {}", "✓".green().bold(), verb, receipt.key.bold());
            print_entry(&receipt.entry);
        }
    }
    Ok(())
}

async fn cmd_remove(config: &ServerConfig, args: RemoveArgs) -> anyhow::Result<()> {
    let state = open_state(config).await?;
    let removed = state.protocol().remove(args.seq).await?;
    let report = state.reconciler().rebuild(RebuildMode::Forced).await?;
    if removed {
        println!("{} Removed delta file {}", "✓".green().bold(), args.seq.to_string().yellow());
    } else {
        println!("Delta file {} was not present.", args.seq.to_string().yellow());
    }
    println!("  Index now lists {} files", report.indexed);
    Ok(())
}

async fn cmd_deltas(config: &ServerConfig, args: DeltasArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let date = args.date.unwrap_or_else(DeltaDate::yesterday);
    let state = open_state(config).await?;
    let doc = state.index().load().await?;
    let entries = doc.on_date(&date);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text if entries.is_empty() => {
            println!("No delta files issued on {}.", date.to_string().bold());
        }
        OutputFormat::Text => {
            println!("Delta files issued on {}:", date.to_string().bold());
            for entry in entries {
                print_entry(entry);
            }
        }
    }
    Ok(())
}

fn cmd_generate_api_key(args: GenerateApiKeyArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let generated = generate_api_key(args.api_key.as_deref())?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "apiKey": generated.key, "digest": generated.digest })
        ),
        OutputFormat::Text => {
            println!("API key: {}", generated.key.yellow().bold());
            println!("Digest:  {}", generated.digest.cyan());
            println!("Add the digest to TARIC_APIKEYS or TARIC_APIKEYS_UPLOAD.");
        }
    }
    Ok(())
}

/// Read `file` in `chunk_size` pieces.
fn file_body(file: tokio::fs::File, chunk_size: usize) -> UploadBody<'static> {
    stream::try_unfold(file, move |mut file| async move {
        let mut buf = BytesMut::with_capacity(chunk_size.max(1));
        if file.read_buf(&mut buf).await? == 0 {
            Ok::<_, std::io::Error>(None)
        } else {
            Ok(Some((buf.freeze(), file)))
        }
    })
    .boxed()
}

fn print_entry(entry: &IndexEntry) {
    println!("  {}  {}", entry.id.to_string().yellow().bold(), entry.issue_date);
    println!("    url:    {}", entry.url.blue());
    println!("    size:   {}", entry.size);
    println!("    sha512: {}", entry.digest.dimmed());
}

fn report_json(report: &RebuildReport) -> serde_json::Value {
    serde_json::json!({
        "skipped": report.skipped,
        "indexed": report.indexed,
        "purged": report.purged,
        "ignored": report.ignored,
        "vanished": report.vanished,
        "swept": report.swept,
    })
}
