//! # Memory Harness CLI (`memh`)
//!
//! The `memh` binary is the primary interface for Memory Harness. It
//! starts the service and provides one-shot commands for uploading,
//! inspecting, searching, and deleting documents.
//!
//! ## Usage
//!
//! ```bash
//! memh --config ./config/memh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memh serve` | Start the HTTP service and pipeline workers |
//! | `memh upload <files>` | Enqueue documents for ingestion |
//! | `memh status <document-id>` | Show a document's pipeline status |
//! | `memh search "<query>"` | Search indexed chunks |
//! | `memh delete-document <document-id>` | Delete one document |
//! | `memh delete-index` | Delete a whole index |
//! | `memh indexes` | List known indexes |
//!
//! ## Examples
//!
//! ```bash
//! # Start the service
//! memh serve --config ./config/memh.toml
//!
//! # Ingest a document with tags
//! memh upload notes.md report.pdf --index docs --tag user:alice
//!
//! # Poll until ready
//! memh status <document-id> --index docs
//!
//! # Search
//! memh search "moon orbit" --index docs --limit 5
//! ```
//!
//! One-shot commands share the durable backends with a running `serve`
//! process through the filesystem, so `memh upload` from a second
//! terminal feeds the workers of the first.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use memory_harness::cancel::cancel_pair;
use memory_harness::config::load_config;
use memory_harness::logging::init_tracing;
use memory_harness::models::{MemoryFilter, TagCollection};
use memory_harness::server::run_server;
use memory_harness::service::{MemoryService, SearchRequest, UploadFile, UploadRequest};

/// Memory Harness — a retrieval-augmented memory service with a durable
/// ingestion pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. See `config/memh.example.toml` for a full
/// example.
#[derive(Parser)]
#[command(
    name = "memh",
    about = "Memory Harness — a retrieval-augmented memory service with a durable ingestion pipeline",
    version,
    long_about = "Memory Harness ingests documents through a durable, resumable pipeline \
    (extract, partition, embed, store), indexes the resulting chunks with their embeddings, \
    and answers queries over the index via a CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service and pipeline workers.
    ///
    /// Runs until interrupted; Ctrl-C drains in-flight handler
    /// invocations before exiting.
    Serve,

    /// Upload one or more files as a single document.
    Upload {
        /// Files to ingest.
        files: Vec<PathBuf>,
        /// Target index; empty uses the configured default.
        #[arg(long, default_value = "")]
        index: String,
        /// Document id; generated when omitted. Re-using an id replaces
        /// the previous document.
        #[arg(long)]
        document_id: Option<String>,
        /// Tag in `key:value` form; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Step plan override; repeatable, in order.
        #[arg(long = "step")]
        steps: Vec<String>,
    },

    /// Show a document's pipeline status.
    Status {
        document_id: String,
        #[arg(long, default_value = "")]
        index: String,
    },

    /// Search indexed chunks.
    Search {
        query: String,
        #[arg(long, default_value = "")]
        index: String,
        /// Maximum results; negative returns all matches.
        #[arg(long)]
        limit: Option<i64>,
        /// Minimum cosine similarity; 0 means unbounded.
        #[arg(long, default_value_t = 0.0)]
        min_relevance: f32,
        /// Filter in `key:value` form; repeatable, combined with AND.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// Delete a document and everything derived from it.
    DeleteDocument {
        document_id: String,
        #[arg(long, default_value = "")]
        index: String,
    },

    /// Delete a whole index: every document, artifact, and record.
    DeleteIndex {
        #[arg(long, default_value = "")]
        index: String,
    },

    /// List known indexes.
    Indexes,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let (handle, token) = cancel_pair();
            let service = Arc::new(
                MemoryService::builder(config)
                    .cancel(token.clone())
                    .build()?,
            );
            let workers = service.start_workers();

            let server = tokio::spawn(run_server(service, token));
            tokio::signal::ctrl_c().await?;
            println!("shutting down");
            handle.cancel();

            for worker in workers {
                let _ = worker.await;
            }
            server.await??;
        }

        Commands::Upload {
            files,
            index,
            document_id,
            tags,
            steps,
        } => {
            if files.is_empty() {
                anyhow::bail!("at least one file is required");
            }
            let mut upload_files = Vec::with_capacity(files.len());
            for path in &files {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                let bytes = std::fs::read(path)?;
                upload_files.push(UploadFile { name, bytes });
            }

            let service = MemoryService::builder(config).build()?;
            let receipt = service
                .upload(UploadRequest {
                    index,
                    document_id,
                    tags: parse_tag_args(&tags)?,
                    steps: if steps.is_empty() { None } else { Some(steps) },
                    files: upload_files,
                })
                .await?;

            println!("accepted");
            println!("  index: {}", receipt.index);
            println!("  documentId: {}", receipt.document_id);
        }

        Commands::Status { document_id, index } => {
            let service = MemoryService::builder(config).build()?;
            let status = service.status(&index, &document_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Search {
            query,
            index,
            limit,
            min_relevance,
            filters,
        } => {
            let service = MemoryService::builder(config).build()?;
            let filters = parse_filter_args(&filters)?;
            let hits = service
                .search(SearchRequest {
                    index,
                    query,
                    filters,
                    min_relevance,
                    limit,
                })
                .await?;

            if hits.is_empty() {
                println!("no results");
            }
            for hit in hits {
                println!(
                    "{:.3}  {}/{}#{}  {}",
                    hit.score,
                    hit.record.document_id,
                    hit.record.source_file,
                    hit.record.part_index,
                    first_line(&hit.record.text)
                );
            }
        }

        Commands::DeleteDocument { document_id, index } => {
            let service = MemoryService::builder(config).build()?;
            service.delete_document(&index, &document_id).await?;
            println!("deleted {document_id}");
        }

        Commands::DeleteIndex { index } => {
            let service = MemoryService::builder(config).build()?;
            service.delete_index(&index).await?;
            println!("deleted index");
        }

        Commands::Indexes => {
            let service = MemoryService::builder(config).build()?;
            for index in service.list_indexes().await? {
                println!("{index}");
            }
        }
    }

    Ok(())
}

fn parse_tag_args(args: &[String]) -> Result<TagCollection> {
    let mut tags = TagCollection::new();
    for arg in args {
        match arg.split_once(':') {
            Some((key, value)) => tags.add(key.trim(), value.trim()),
            None => tags.add_key(arg.trim()),
        }
    }
    Ok(tags)
}

/// CLI filters combine into a single conjunction.
fn parse_filter_args(args: &[String]) -> Result<Vec<MemoryFilter>> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    let mut filter = MemoryFilter::new();
    for arg in args {
        let (key, value) = arg
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("filter '{arg}' must be key:value"))?;
        filter = filter.with(key.trim(), value.trim());
    }
    Ok(vec![filter])
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
