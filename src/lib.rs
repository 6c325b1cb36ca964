//! calibre-opds: a read-only OPDS catalog server for Calibre libraries.
//!
//! This crate serves an OPDS 1.2 catalog straight from Calibre's
//! `metadata.db`, which it only ever opens read-only. E-readers can browse
//! the library by author, series and tag and download any stored format.
//!
//! # Features
//!
//! - OPDS 1.2 navigation and acquisition feeds
//! - Offset pagination with first/previous/next/last links
//! - Title and author search with an OpenSearch description
//! - Book downloads and cover images straight from the library folder
//! - Liveness (`/healthz`) and readiness (`/ready`) probes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Read-only Calibre catalog access.
pub mod catalog;
/// Configuration and CLI.
pub mod config;
/// Error types.
pub mod error;
/// Book, group and page models.
pub mod library;
/// OPDS feed generation.
pub mod opds;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use catalog::Catalog;
pub use config::{Cli, Command, Config};
pub use error::{AppError, Result};
pub use server::AppState;
