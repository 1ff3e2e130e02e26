//! # Core
//!
//! Core of the harness: the artifact model, configuration binding, handler
//! attachment, record collection and the top-level run sequencing.

pub(crate) mod artifact;
pub(crate) mod attacher;
pub(crate) mod binder;
pub(crate) mod bpf;
pub(crate) mod collector;
pub(crate) mod errors;
pub(crate) mod harness;
pub(crate) mod kernel;
pub(crate) mod loader;
