//! # chatclass-core
//!
//! Core library for chatclass - incremental classification of chat sessions
//! and messages.
//!
//! This library provides:
//! - Domain types for messages, sessions and classification rows
//! - Database storage layer with SQLite behind the [`SessionStore`] trait
//! - Classifier client with retry, re-prompt and fatal-abort handling
//! - Instruction providers (local files or HTTP blob storage)
//! - The [`Pipeline`] orchestrator
//! - Configuration management and logging infrastructure
//!
//! ## Guarantees
//!
//! - **Idempotent:** re-running without new data writes nothing new; message
//!   rows are only replaced when reclassification is requested.
//! - **Incremental:** a session is reclassified only when it has messages
//!   newer than its stored `processed_upto` watermark.
//!
//! ## Example
//!
//! ```rust,no_run
//! use chatclass_core::classifier::{create_completion_client, LlmClassifier, ResilientClassifier, RetryPolicy};
//! use chatclass_core::instructions::create_instruction_provider;
//! use chatclass_core::{Config, Database, Pipeline, PipelineOptions, Taxonomy};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&config.resolved_database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let taxonomy = Taxonomy::from_config(&config.taxonomy).expect("invalid taxonomy");
//! let client = create_completion_client(&config.llm).expect("failed to build client");
//! let classifier = ResilientClassifier::new(
//!     LlmClassifier::new(client, taxonomy.clone()),
//!     RetryPolicy::from_config(&config.retry),
//! );
//! let provider = create_instruction_provider(&config.instructions).expect("bad instructions");
//! let options = PipelineOptions::from_config(&config).expect("bad options");
//!
//! let summary = Pipeline::new(&db, &classifier, provider.as_ref(), &taxonomy, options)
//!     .run()
//!     .expect("run aborted");
//! println!("{} messages classified", summary.messages_classified);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{CandidateFilter, Database, SessionStore};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineOptions, RunSummary};
pub use taxonomy::Taxonomy;
pub use types::*;

// Public modules
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod instructions;
pub mod logging;
pub mod pipeline;
pub mod taxonomy;
pub mod types;
