//! # docchat
//!
//! Upload a document, have it indexed for semantic retrieval, and chat with
//! an assistant that answers from the retrieved passages and the recent
//! conversation, streaming the answer back as it is generated.
//!
//! ## Architecture
//!
//! ```text
//! upload event ──▶ ┌───────────┐   fetch → extract → embed   ┌──────────┐
//!                  │  Ingestor │ ─────────────────────────▶ │  SQLite   │
//!                  └───────────┘                             │ docs/vecs │
//!                                                            └────┬─────┘
//! chat send ─────▶ ┌─────────────┐  retrieve + history + prompt   │
//!                  │ ChatService │ ◀──────────────────────────────┘
//!                  └──────┬──────┘
//!                         │ text/plain stream
//!                         ▼
//!                  ┌────────────┐
//!                  │ ChatEngine │  optimistic view, settle / rollback
//!                  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat init
//! docchat token alice                       # prints a bearer token
//! docchat ingest ./report.pdf --owner alice
//! docchat serve
//! docchat chat <document-id> "What is the summary?" --token <token>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`plans`] | Plan tiers and limits |
//! | [`store`] | Document, message and subscription repositories |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`extract`] | Page-level text extraction |
//! | [`fetch`] | Upload retrieval |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index |
//! | [`generation`] | Streaming text generation |
//! | [`ingest`] | Ingestion pipeline |
//! | [`chat`] | Retrieval-augmented chat pipeline |
//! | [`session`] | Bearer session tokens |
//! | [`billing`] | Billing webhook |
//! | [`server`] | HTTP API |
//! | [`client`] | Streaming reconciliation engine |

pub mod billing;
pub mod chat;
pub mod client;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod plans;
pub mod server;
pub mod session;
pub mod store;
