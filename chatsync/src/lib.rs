//! `ChatSync` — client-side chat history and delivery engine.
//!
//! Keeps a locally persisted, gap-free ordered history for one
//! conversation, synchronizes it against a remote authority, and
//! reliably delivers outgoing messages across network failures,
//! retries, and process restarts.

pub mod config;
pub mod conversation;
pub mod history;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
