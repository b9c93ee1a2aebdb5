//! Fast re-preprocessing against a snapshot.
//!
//! Instead of walking the include graph again, the environment is
//! pre-seeded with every macro defined by the document's transitive
//! resolved includes (injected `<...>` documents first). The engine then
//! runs with function-like expansion off and comments kept, which is
//! enough for a quick re-tokenisation pass, and the client records what
//! the run learns onto the document under construction.

use crate::client::{is_injected_file, Client, IncludeType, MacroArgumentReference};
use crate::engine::Preprocessor;
use crate::environment::Environment;
use crate::macros::Macro;
use crate::snapshot::{Document, Include, MacroUse, Snapshot, UndefinedMacroUse};
use std::collections::HashSet;
use tracing::debug;

/// Carry the source document's revision on a macro merged or recorded
/// from the snapshot.
fn with_revision(snapshot: &Snapshot, mac: &Macro) -> Macro {
	let mut mac = mac.clone();
	if let Some(doc) = snapshot.document(&mac.file_path) {
		mac.file_revision = doc.revision;
	}
	mac
}

/// The recording client half: owns the document under construction so the
/// engine half can borrow the environment independently.
struct FastClient {
	snapshot: Snapshot,
	merged: HashSet<String>,
	current_doc: Document,
	add_includes_to_current_doc: bool,
}

impl FastClient {
	/// Merge `path`'s macros (and, depth-first, those of its resolved
	/// includes) into the environment, each file at most once.
	fn merge_environment(&mut self, env: &mut Environment, path: &str) {
		if !self.merged.insert(path.to_owned()) {
			return;
		}
		let Some(doc) = self.snapshot.document(path) else {
			debug!(%path, "not in snapshot; macros from it stay undefined");
			return;
		};
		for include in doc.resolved_includes.clone() {
			self.merge_environment(env, &include.resolved_path);
		}
		let stamped: Vec<Macro> = doc.defined_macros.iter().map(|m| with_revision(&self.snapshot, m)).collect();
		env.add_macros(&stamped);
	}

	fn record_use(&mut self, mac: &Macro, bytes_offset: u32, utf16_offset: u32, line: u32, actuals: &[MacroArgumentReference]) {
		self.current_doc.macro_uses.push(MacroUse {
			mac: with_revision(&self.snapshot, mac),
			bytes_offset,
			bytes_length: mac.name.len() as u32,
			utf16_offset,
			utf16_length: mac.name.len() as u32,
			line,
			actuals: actuals.to_vec(),
		});
	}
}

impl Client for FastClient {
	fn macro_added(&mut self, mac: &Macro) {
		self.current_doc.defined_macros.push(mac.clone());
	}

	fn defined_check_passed(&mut self, bytes_offset: u32, utf16_offset: u32, line: u32, mac: &Macro) {
		self.record_use(mac, bytes_offset, utf16_offset, line, &[]);
	}

	fn defined_check_failed(&mut self, bytes_offset: u32, utf16_offset: u32, name: &[u8]) {
		self.current_doc.undefined_macro_uses.push(UndefinedMacroUse {
			name: name.to_vec(),
			bytes_offset,
			utf16_offset,
		});
	}

	fn macro_reference(&mut self, bytes_offset: u32, utf16_offset: u32, line: u32, mac: &Macro) {
		self.record_use(mac, bytes_offset, utf16_offset, line, &[]);
	}

	fn expansion_started(
		&mut self, bytes_offset: u32, utf16_offset: u32, line: u32, mac: &Macro,
		actuals: &[MacroArgumentReference],
	) {
		self.record_use(mac, bytes_offset, utf16_offset, line, actuals);
	}

	fn include_guard_detected(&mut self, name: &[u8]) {
		self.current_doc.include_guard_macro_name = Some(name.to_vec());
	}

	fn source_needed(
		&mut self, env: &mut Environment, line: u32, path: &str, mode: IncludeType, _initial_includes: &[String],
	) {
		if self.add_includes_to_current_doc {
			self.current_doc.resolved_includes.push(Include {
				unresolved_path: path.to_owned(),
				resolved_path: path.to_owned(),
				line,
				mode,
			});
		}
		self.merge_environment(env, path);
	}
}

pub struct FastPreprocessor {
	snapshot: Snapshot,
	env: Environment,
	client: FastClient,
}

impl FastPreprocessor {
	pub fn new(snapshot: Snapshot) -> Self {
		Self {
			env: Environment::new(),
			client: FastClient {
				snapshot: snapshot.clone(),
				merged: HashSet::new(),
				current_doc: Document::default(),
				add_includes_to_current_doc: false,
			},
			snapshot,
		}
	}

	/// Preprocess `source` for `doc`, seeding the environment from the
	/// snapshot. Returns the preprocessed bytes and the document enriched
	/// with what the run discovered.
	pub fn run(&mut self, doc: Document, source: &[u8], merge_defined_macros_of_document: bool) -> (Vec<u8>, Document) {
		let path = doc.path.clone();
		self.client.add_includes_to_current_doc =
			doc.resolved_includes.is_empty() && doc.unresolved_includes.is_empty();
		self.client.current_doc = doc;

		if self.snapshot.contains(&path) {
			self.client.merged.insert(path.clone());

			// Host-injected virtual documents seed everything.
			for injected in self.snapshot.paths() {
				if is_injected_file(&injected) {
					self.client.merge_environment(&mut self.env, &injected);
				}
			}

			if let Some(snapshot_doc) = self.snapshot.document(&path) {
				for include in snapshot_doc.resolved_includes.clone() {
					self.client.merge_environment(&mut self.env, &include.resolved_path);
				}
			}

			if merge_defined_macros_of_document {
				let own = self.client.current_doc.defined_macros.clone();
				self.env.add_macros(&own);
			}
		}

		let mut preproc = Preprocessor::new(Some(&mut self.client), &mut self.env);
		preproc.set_expand_function_like_macros(false);
		preproc.set_keep_comments(true);
		let preprocessed = preproc.run(&path, source);

		let finished = std::mem::take(&mut self.client.current_doc);
		(preprocessed, finished)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn doc_with_macro(path: &str, revision: u32, name: &str, body_text: &str) -> Document {
		let mut doc = Document::new(path, revision);
		doc.defined_macros.push(Macro {
			name: name.into(),
			definition_text: body_text.as_bytes().to_vec(),
			file_path: path.to_owned(),
			..Macro::default()
		});
		doc
	}

	#[test]
	fn seeds_macros_from_resolved_includes() {
		let snapshot = Snapshot::new();
		snapshot.insert(doc_with_macro("config.h", 1, "ENABLED", "1"));
		let mut main_doc = Document::new("main.c", 1);
		main_doc.resolved_includes.push(Include {
			unresolved_path: "config.h".to_owned(),
			resolved_path: "config.h".to_owned(),
			line: 1,
			mode: IncludeType::Local,
		});
		snapshot.insert(main_doc.clone());

		let mut fast = FastPreprocessor::new(snapshot);
		let (out, _) = fast.run(main_doc, b"#ifdef ENABLED\nyes\n#endif\n", false);
		let out = String::from_utf8(out).unwrap();
		assert!(out.contains("yes"));
	}

	#[test]
	fn transitive_includes_are_merged_once() {
		let snapshot = Snapshot::new();
		let mut a = doc_with_macro("a.h", 1, "A", "1");
		a.resolved_includes.push(Include {
			unresolved_path: "b.h".to_owned(),
			resolved_path: "b.h".to_owned(),
			line: 1,
			mode: IncludeType::Local,
		});
		snapshot.insert(a);
		// b includes a back; the merge set breaks the cycle.
		let mut b = doc_with_macro("b.h", 1, "B", "2");
		b.resolved_includes.push(Include {
			unresolved_path: "a.h".to_owned(),
			resolved_path: "a.h".to_owned(),
			line: 1,
			mode: IncludeType::Local,
		});
		snapshot.insert(b);

		let mut main_doc = Document::new("main.c", 1);
		main_doc.resolved_includes.push(Include {
			unresolved_path: "a.h".to_owned(),
			resolved_path: "a.h".to_owned(),
			line: 1,
			mode: IncludeType::Local,
		});
		snapshot.insert(main_doc.clone());

		let mut fast = FastPreprocessor::new(snapshot);
		let (out, _) = fast.run(main_doc, b"#if defined(A) && defined(B)\nboth\n#endif\n", false);
		assert!(String::from_utf8(out).unwrap().contains("both"));
	}

	#[test]
	fn injected_documents_seed_first() {
		let snapshot = Snapshot::new();
		snapshot.insert(doc_with_macro("<configuration>", 1, "FROM_CONFIG", "1"));
		snapshot.insert(Document::new("main.c", 1));

		let mut fast = FastPreprocessor::new(snapshot);
		let (out, _) = fast.run(Document::new("main.c", 1), b"#ifdef FROM_CONFIG\nconfigured\n#endif\n", false);
		assert!(String::from_utf8(out).unwrap().contains("configured"));
	}

	#[test]
	fn function_like_macros_stay_unexpanded() {
		let snapshot = Snapshot::new();
		snapshot.insert(Document::new("main.c", 1));
		let mut fast = FastPreprocessor::new(snapshot);
		let (out, doc) = fast.run(Document::new("main.c", 1), b"#define F(x) x\nF(1)\n", false);
		let out = String::from_utf8(out).unwrap();
		assert!(out.contains("F(1)"));
		// The unexpanded use is still recorded.
		assert!(doc.macro_uses.iter().any(|u| u.mac.name.as_str() == "F"));
		assert_eq!(doc.defined_macros.len(), 1);
	}

	#[test]
	fn new_include_edges_are_recorded() {
		let snapshot = Snapshot::new();
		let mut fast = FastPreprocessor::new(snapshot);
		let (_, doc) = fast.run(Document::new("main.c", 1), b"#include \"dep.h\"\n", false);
		assert_eq!(doc.resolved_includes.len(), 1);
		assert_eq!(doc.resolved_includes[0].resolved_path, "dep.h");
		assert_eq!(doc.resolved_includes[0].mode, IncludeType::Local);
	}

	#[test]
	fn known_include_edges_are_not_duplicated() {
		let snapshot = Snapshot::new();
		let mut doc = Document::new("main.c", 1);
		doc.resolved_includes.push(Include {
			unresolved_path: "dep.h".to_owned(),
			resolved_path: "dep.h".to_owned(),
			line: 1,
			mode: IncludeType::Local,
		});
		let mut fast = FastPreprocessor::new(snapshot);
		let (_, out_doc) = fast.run(doc, b"#include \"dep.h\"\n", false);
		assert_eq!(out_doc.resolved_includes.len(), 1);
	}

	#[test]
	fn include_guard_lands_on_document() {
		let snapshot = Snapshot::new();
		let mut fast = FastPreprocessor::new(snapshot);
		let (_, doc) = fast.run(Document::new("h.h", 1), b"#ifndef H_H\n#define H_H\nint x;\n#endif\n", false);
		assert_eq!(doc.include_guard_macro_name.as_deref(), Some(&b"H_H"[..]));
	}

	#[test]
	fn merged_macros_carry_snapshot_revision() {
		let snapshot = Snapshot::new();
		snapshot.insert(doc_with_macro("dep.h", 7, "DEP", "1"));
		snapshot.insert(Document::new("main.c", 1));
		let mut fast = FastPreprocessor::new(snapshot);
		let (_, doc) = fast.run(Document::new("main.c", 1), b"#include \"dep.h\"\n#ifdef DEP\nx\n#endif\n", false);
		let dep_use = doc.macro_uses.iter().find(|u| u.mac.name.as_str() == "DEP").unwrap();
		assert_eq!(dep_use.mac.file_revision, 7);
	}
}
