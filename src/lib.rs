//! Shared memory for agent types: a knowledge graph that many instances of the
//! same kind of agent read from and contribute to.
//!
//! Cairn stores *fragments* (patterns, facts, anti-patterns) under an agent type
//! and serves them back to any instance of that type, ranked by quality, context
//! match and recency. Fragments carry a composite quality score that moves with
//! feedback and time, a validity window, and a place in a supersession DAG.
//! When two fragments contradict each other the conflict engine detects,
//! classifies and resolves the pair, falling back to an external debate oracle
//! and, failing that, escalation.
//!
//! | Kind | Purpose |
//! |------|---------|
//! | **Procedural** | How to do something |
//! | **Declarative** | Facts about a system or the world |
//! | **Meta** | How to apply other knowledge |
//! | **Anti-pattern** | What looked right and was not |
//!
//! # Architecture
//!
//! - **Storage**: SQLite for the graph, quality history and the append-only
//!   conflict ledger; [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions),
//!   or a deterministic hashing provider
//! - **Transport**: MCP over stdio (primary) or Streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations and health checks
//! - [`embedding`]: text-to-vector providers
//! - [`memory`]: the memory graph itself; start at [`memory::SharedMemory`]

pub mod config;
pub mod db;
pub mod embedding;
pub mod memory;
