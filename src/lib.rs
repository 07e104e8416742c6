//! # docchat
//!
//! Question answering over a local document collection, with long-term
//! conversational memory.
//!
//! Documents are chunked, embedded, and stored in a vector index. Each
//! question retrieves the closest chunks plus the most relevant earlier
//! turns of the conversation, goes to a language model with them, and the
//! exchange is saved back to memory under collision-free turn ids.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐
//! │ Loaders  │──▶│ Chunker  │──▶│ corpus index │──┐
//! │ pdf/docx │   └──────────┘   └─────────────┘  │   ┌────────────┐
//! │ txt/csv  │                                   ├──▶│ ChatSession│──▶ ChatModel
//! └──────────┘                  ┌─────────────┐  │   └─────┬──────┘
//!                               │conversations│◀─┘─────────┘
//!                               └─────────────┘   append turns
//!                        (both indexes live in one SQLite store)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error types |
//! | [`models`] | Core data types |
//! | [`loader`] | PDF, DOCX, text, Markdown, and CSV readers |
//! | [`chunk`] | Overlapping character-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Storage backends (SQLite, in-memory) |
//! | [`index`] | Named vector index with k-NN queries |
//! | [`corpus`] | Document corpus builder |
//! | [`memory`] | Conversation memory and turn-id allocation |
//! | [`llm`] | Chat model abstraction and OpenAI client |
//! | [`tokenizer`] | Tokenizers for cost accounting |
//! | [`cost`] | Per-exchange cost estimates |
//! | [`chat`] | Retrieval orchestrator |
//! | [`engine`] | Config-driven wiring used by the CLI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod corpus;
pub mod cost;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod llm;
pub mod loader;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod repl;
pub mod stats;
pub mod store;
pub mod tokenizer;
