//! # Memory Harness
//!
//! **A retrieval-augmented memory service with a durable ingestion
//! pipeline.**
//!
//! Memory Harness ingests heterogeneous documents (text, PDFs, office
//! files, web pages), drives them through a configurable sequence of
//! pipeline steps, and answers natural-language queries by retrieving
//! the most relevant fragments.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────────┐   ┌───────────┐
//! │  Upload  │──▶│   Queue    │──▶│ Orchestrator  │──▶│ Retrieval │
//! │ HTTP/CLI │   │ FIFO/lease │   │ workers×N     │   │   Index   │
//! └──────────┘   └────────────┘   └──────┬────────┘   └─────┬─────┘
//!                                        │                  │
//!                                 ┌──────▼────────┐   ┌─────▼─────┐
//!                                 │ Artifact Store│   │  /search  │
//!                                 │ + state record│   │   /ask    │
//!                                 └───────────────┘   └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. An **upload** is validated, its source files land in the
//!    [`artifacts`] store, a [`models::PipelineState`] record is
//!    persisted, and one message enters the [`queue`].
//! 2. **Workers** ([`orchestrator`]) dequeue, look the next step up in
//!    the [`handlers`] registry, and invoke it. Each step reads and
//!    writes artifacts and mutates the state record, which is persisted
//!    after every successful step.
//! 3. The default plan is `extract_text` → `partition_text` →
//!    `generate_embeddings` → `save_records`; the terminal step writes
//!    tagged chunks into the retrieval [`index`].
//! 4. **Search** embeds the query and returns the nearest chunks;
//!    **ask** assembles a grounded extractive answer with citations.
//!
//! Delivery is at-least-once and every handler is idempotent: artifact
//! keys are deterministic functions of (document, file, step, part), so
//! a crashed and re-delivered step overwrites its own output. The queue
//! guarantees per-document FIFO with one lease at a time; repeated
//! transient failures dead-letter the message and fail the document with
//! a `poisoned:` reason.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Tags, filters, pipeline state, index-name rules |
//! | [`artifacts`] | Content-addressed blob store (memory, filesystem) |
//! | [`queue`] | Durable work queue with leases and dead letters |
//! | [`state`] | Pipeline state persistence over the artifact store |
//! | [`handlers`] | Step contract, registry, built-in steps |
//! | [`orchestrator`] | Worker loop: dispatch, retry, poison handling |
//! | [`extract`] | PDF/OOXML/HTML/plain-text extraction |
//! | [`chunk`] | Paragraph-boundary partitioner |
//! | [`embedding`] | Embedding provider trait + OpenAI/Ollama backends |
//! | [`index`] | Retrieval index trait + in-memory implementation |
//! | [`service`] | In-process client contract (`MemoryService`) |
//! | [`report`] | Read-only status projection |
//! | [`server`] | HTTP surface (Axum) with CORS |
//! | [`metrics`] | Atomic pipeline counters |
//! | [`cancel`] | Cooperative cancellation tokens |
//! | [`logging`] | Tracing subscriber setup |

pub mod artifacts;
pub mod cancel;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod index;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod report;
pub mod server;
pub mod service;
pub mod state;
