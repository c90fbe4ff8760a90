//! Evidex - Domain-Aware Evidence Retrieval Engine
//!
//! Answers structured queries over a corpus of pre-segmented clinical text
//! units by fanning out to heterogeneous retrieval backends (lexical, sparse
//! term-expansion, dense vector, optional graph-assisted), fusing their
//! incomparable score scales into one explainable ranking, assembling
//! neighboring units into coherent passages, and caching responses.

pub mod cache;
pub mod concept;
pub mod config;
pub mod corpus;
pub mod error;
pub mod fusion;
pub mod passage;
pub mod query;
pub mod rerank;
pub mod retriever;
pub mod service;

pub use error::{EvidexError, Result};
