//! batchio Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling and logging for the batchio workspace.
//!
//! # Overview
//!
//! - **Types**: file fragments, logical units and the records read from them
//! - **Error Handling**: the crate-wide error enum and result alias
//! - **Logging**: tracing subscriber bootstrap shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use batchio_common::types::{FileFragment, LogicalUnit};
//!
//! let unit = LogicalUnit::new(vec![
//!     FileFragment::new("/data/a.txt", 0, 100),
//!     FileFragment::new("/data/b.txt", 0, 250),
//! ]);
//! assert_eq!(unit.total_length(), 350);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{BatchioError, Result};
