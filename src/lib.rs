//! epub2pdf: convert EPUB e-books to paginated PDF.
//!
//! The conversion pipeline extracts the package's reading order, normalizes
//! each XHTML content document into a small block model, synthesizes one
//! self-contained HTML document, and renders it to PDF in memory.
//!
//! # Features
//!
//! - Chapter order preserved, one page break per chapter
//! - Heading levels, with detection for books lacking heading markup
//! - Bold, italic, color, alignment and indentation
//! - Embedded images scaled to the page
//! - HTTP upload service and command-line conversion
//! - Inspectable snapshot of the last synthesized document

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration and CLI.
pub mod config;
/// Conversion pipeline.
pub mod convert;
/// Error types.
pub mod error;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use convert::Converter;
pub use error::{AppError, ConvertError, Result};
pub use server::AppState;
