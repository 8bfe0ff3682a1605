//! Core types for the vellum document store.
//!
//! Vellum stores JSON-like documents in SQLite, validated against a
//! declarative [`Shape`], with selected fields promoted to native columns
//! via the constrained-field [`catalog`]. This crate holds the document
//! value model, shapes and validation, the codec, ID generation, and the
//! error taxonomy shared by the whole workspace.

pub mod catalog;
pub mod codec;
pub mod error;
pub mod id;
pub mod shape;
pub mod value;

// Re-exports for convenience.
pub use catalog::{CollectionSchema, ConstrainedField, FkAction, ForeignKey, SqlType};
pub use codec::DocumentCache;
pub use error::{Result, VellumError};
pub use shape::{FieldType, Shape, ShapeError};
pub use value::{DocValue, ID_KEY, VERSION_KEY};
