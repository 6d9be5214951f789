//! # ReviewLens
//!
//! Streaming competitive analysis of mobile apps from their user reviews.
//!
//! ReviewLens resolves free-form input (package names, store URLs, `vs`
//! phrases) into app identifiers, fetches store metadata and reviews with a
//! 30-day cache, analyzes each app's review sample with a structured LLM
//! call, compares the apps against each other, and streams every result as
//! NDJSON events the moment it exists.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────┐
//! │ Resolver │──▶│ Orchestrator │──▶│  Stream   │
//! └──────────┘   │  (fan-out)   │   │ (NDJSON)  │
//!                └──────┬──────┘   └──────────┘
//!                       │
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!     ┌─────────┐  ┌─────────┐  ┌─────────┐
//!     │ Fetcher │  │Analyzer │  │ Compare │
//!     │ (stores)│  │  (LLM)  │  │  (LLM)  │
//!     └────┬────┘  └─────────┘  └─────────┘
//!          ▼
//!     ┌─────────┐
//!     │ SQLite  │
//!     │ (cache) │
//!     └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the stream event protocol |
//! | [`resolver`] | Free-form input → app identifiers |
//! | [`fetcher`] | Google Play / App Store fetching |
//! | [`store`] | SQLite cache with TTL and wholesale review replacement |
//! | [`llm`] | Structured generation + streaming chat behind a trait |
//! | [`analyzer`] | Stratified sampling + structured single-app analysis |
//! | [`compare`] | Cross-app aggregation and the 7-step action plan |
//! | [`orchestrator`] | Parallel fan-out and event streaming |
//! | [`reducer`] | Idempotent client-side stream fold |
//! | [`server`] | NDJSON-streaming HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analyzer;
pub mod compare;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod reducer;
pub mod resolver;
pub mod server;
pub mod store;
