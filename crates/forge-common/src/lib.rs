//! # forge-common
//!
//! Common types, errors, and file-format constants for ForgeDB.
//!
//! This crate provides the foundations shared by the storage engine and the
//! CLI:
//!
//! - **Types**: the [`PageId`](types::PageId) identifier
//! - **Errors**: unified error handling with [`ForgeError`]
//! - **Constants**: every byte offset of the on-disk file format

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ErrorCode, ForgeError, ForgeResult};
pub use types::PageId;
