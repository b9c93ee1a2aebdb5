//! Host-side document records and the snapshot that shares them between
//! preprocessor runs.
//!
//! A [`Document`] is everything a previous run learned about one file:
//! its resolved include edges, the macros it defined, where macros were
//! used, and its include guard. The [`Snapshot`] indexes documents by
//! path; the host writes it between runs, drivers read it during runs
//! (many drivers may share one snapshot, each with its own environment).

use crate::client::{IncludeType, MacroArgumentReference};
use crate::macros::Macro;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// One resolved `#include` edge.
#[derive(Clone, Debug)]
pub struct Include {
	/// The path as written in the directive, delimiters stripped.
	pub unresolved_path: String,
	/// Where the host found it.
	pub resolved_path: String,
	pub line: u32,
	pub mode: IncludeType,
}

/// One recorded use of a macro (an expansion, a `defined` hit, a
/// reference without expansion).
#[derive(Clone, Debug)]
pub struct MacroUse {
	pub mac: Macro,
	pub bytes_offset: u32,
	pub bytes_length: u32,
	pub utf16_offset: u32,
	pub utf16_length: u32,
	pub line: u32,
	pub actuals: Vec<MacroArgumentReference>,
}

/// A `defined`/`#ifdef` check that found nothing.
#[derive(Clone, Debug)]
pub struct UndefinedMacroUse {
	pub name: Vec<u8>,
	pub bytes_offset: u32,
	pub utf16_offset: u32,
}

#[derive(Clone, Debug, Default)]
pub struct Document {
	pub path: String,
	pub revision: u32,
	pub resolved_includes: Vec<Include>,
	pub unresolved_includes: Vec<String>,
	pub defined_macros: Vec<Macro>,
	pub macro_uses: Vec<MacroUse>,
	pub undefined_macro_uses: Vec<UndefinedMacroUse>,
	pub include_guard_macro_name: Option<Vec<u8>>,
}

impl Document {
	pub fn new(path: impl Into<String>, revision: u32) -> Self {
		Self { path: path.into(), revision, ..Self::default() }
	}
}

/// Read-mostly index from file path to document. Cloning shares the
/// underlying store.
#[derive(Clone, Default)]
pub struct Snapshot {
	documents: Arc<RwLock<HashMap<String, Arc<Document>>>>,
}

impl Snapshot {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or replace; the host must not do this while a run that uses
	/// this snapshot is in flight.
	pub fn insert(&self, doc: Document) {
		self.documents.write().insert(doc.path.clone(), Arc::new(doc));
	}

	pub fn document(&self, path: &str) -> Option<Arc<Document>> {
		self.documents.read().get(path).cloned()
	}

	pub fn contains(&self, path: &str) -> bool {
		self.documents.read().contains_key(path)
	}

	pub fn len(&self) -> usize {
		self.documents.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.documents.read().is_empty()
	}

	/// All document paths, for callers that need to scan (e.g. for
	/// injected `<...>` files).
	pub fn paths(&self) -> Vec<String> {
		self.documents.read().keys().cloned().collect()
	}
}
