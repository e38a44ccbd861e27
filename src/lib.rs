//! Warden Engine Library
//!
//! Warden is a deterministic governance runtime for agentic LLM workers.
//! A task spec declares a goal, a definition of done, and verifiable
//! evidence; the runtime drives a model adapter through a bounded
//! episodic loop under a declarative policy. The model is never in the
//! control path: stop, budget, scope, and verification decisions are
//! made by rule.

/// Task specification loading and validation
pub mod spec;

/// Policy record and pure enforcement checks
pub mod policy;

/// Model adapter contract and conversation types
pub mod provider;

/// SQLite persistence and vector memory
pub mod store;

/// Tool proxy: sandboxed subprocess execution with artifact capture
pub mod proxy;

/// Session execution loop
pub mod session;

/// Telemetry and structured logging setup
pub mod telemetry;

/// CLI interface module
pub mod cli;
