//! The macro store for one translation unit.
//!
//! Bindings are append-only: a redefinition shadows, an `#undef` binds a
//! hidden sentinel. Tooling can therefore replay every binding change in
//! order, while `resolve` only ever sees the newest live definition.
//! Lookup goes through a hand-rolled hash table: per-bucket chains held in
//! a side table of indices, newest entry at the chain head.

use crate::error::EnvironmentError;
use crate::macros::Macro;
use tracing::debug;

const INITIAL_BUCKETS: usize = 401;
const NO_ENTRY: u32 = u32::MAX;

fn hash_code(bytes: &[u8]) -> u32 {
	let mut hash: u32 = 0;
	for &b in bytes {
		hash = (hash << 5).wrapping_sub(hash).wrapping_add(u32::from(b));
	}
	hash
}

#[derive(Default)]
pub struct Environment {
	/// File currently being preprocessed; used for line markers,
	/// `__FILE__` and sentinel attribution.
	pub current_file: String,
	/// Last line synchronised into the output.
	pub current_line: u32,
	macros: Vec<Macro>,
	hashes: Vec<u32>,
	/// Chain link per macro, same index as `macros`.
	chain: Vec<u32>,
	/// Chain heads; rebuilt on rehash.
	buckets: Vec<u32>,
}

impl Environment {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn macro_count(&self) -> usize {
		self.macros.len()
	}

	pub fn macro_at(&self, index: usize) -> Option<&Macro> {
		self.macros.get(index)
	}

	/// Every binding in insertion order, hidden sentinels included.
	pub fn iter(&self) -> impl Iterator<Item = &Macro> {
		self.macros.iter()
	}

	/// Append a binding. Always appends, never replaces: the newest entry
	/// wins lookups, older ones stay visible to iteration.
	pub fn bind(&mut self, mac: Macro) -> Result<&Macro, EnvironmentError> {
		if mac.name.is_empty() {
			return Err(EnvironmentError::EmptyMacroName);
		}
		let hash = hash_code(mac.name.as_bytes());
		let index = self.macros.len() as u32;
		self.macros.push(mac);
		self.hashes.push(hash);
		if self.buckets.is_empty() || self.macros.len() > self.buckets.len() / 2 {
			self.chain.push(NO_ENTRY);
			self.rehash();
		} else {
			let bucket = hash as usize % self.buckets.len();
			self.chain.push(self.buckets[bucket]);
			self.buckets[bucket] = index;
		}
		Ok(&self.macros[index as usize])
	}

	/// Shadow `name` with a hidden sentinel so `resolve` stops seeing it.
	/// Returns the sentinel so the caller can attach source offsets.
	pub fn remove(&mut self, name: &[u8]) -> &mut Macro {
		let sentinel = Macro {
			name: String::from_utf8_lossy(name).as_ref().into(),
			hidden: true,
			file_path: self.current_file.clone(),
			line: self.current_line,
			..Macro::default()
		};
		// The sentinel name comes from an identifier token, never empty.
		self.bind(sentinel).expect("sentinel name is non-empty");
		self.macros.last_mut().expect("sentinel was just bound")
	}

	/// Newest live binding for `name`, if any.
	pub fn resolve(&self, name: &[u8]) -> Option<&Macro> {
		if self.buckets.is_empty() {
			return None;
		}
		let hash = hash_code(name);
		let mut it = self.buckets[hash as usize % self.buckets.len()];
		while it != NO_ENTRY {
			let mac = &self.macros[it as usize];
			if self.hashes[it as usize] == hash && mac.name.as_bytes() == name {
				return if mac.hidden { None } else { Some(mac) };
			}
			it = self.chain[it as usize];
		}
		None
	}

	/// Bulk merge, e.g. from a snapshot document.
	pub fn add_macros(&mut self, macros: &[Macro]) {
		for mac in macros {
			if self.bind(mac.clone()).is_err() {
				debug!("skipping nameless macro from merge");
			}
		}
	}

	pub fn reset(&mut self) {
		self.macros.clear();
		self.hashes.clear();
		self.chain.clear();
		self.buckets.clear();
	}

	/// `__DATE__`, `__FILE__`, `__LINE__`, `__TIME__` are intercepted
	/// during expansion and never stored here.
	pub fn is_builtin_macro(name: &[u8]) -> bool {
		matches!(name, b"__DATE__" | b"__FILE__" | b"__LINE__" | b"__TIME__")
	}

	fn rehash(&mut self) {
		let count = if self.buckets.is_empty() { INITIAL_BUCKETS } else { self.buckets.len() << 1 };
		self.buckets = vec![NO_ENTRY; count];
		for index in 0..self.macros.len() {
			let bucket = self.hashes[index] as usize % count;
			self.chain[index] = self.buckets[bucket];
			self.buckets[bucket] = index as u32;
		}
	}

	pub fn dump(&self) {
		for mac in &self.macros {
			debug!("{}", mac.to_display_string());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn named(name: &str) -> Macro {
		Macro { name: name.into(), ..Macro::default() }
	}

	#[test]
	fn resolve_finds_newest() {
		let mut env = Environment::new();
		let mut first = named("X");
		first.definition_text = b"1".to_vec();
		env.bind(first).unwrap();
		let mut second = named("X");
		second.definition_text = b"2".to_vec();
		env.bind(second).unwrap();
		assert_eq!(env.resolve(b"X").unwrap().definition_text, b"2");
		assert_eq!(env.macro_count(), 2);
	}

	#[test]
	fn remove_shadows_but_keeps_history() {
		let mut env = Environment::new();
		env.bind(named("X")).unwrap();
		env.remove(b"X");
		assert!(env.resolve(b"X").is_none());
		assert_eq!(env.macro_count(), 2);
		assert!(env.iter().last().unwrap().hidden);
	}

	#[test]
	fn rebinding_after_remove_resolves_again() {
		let mut env = Environment::new();
		env.bind(named("X")).unwrap();
		env.remove(b"X");
		env.bind(named("X")).unwrap();
		assert!(env.resolve(b"X").is_some());
	}

	#[test]
	fn empty_name_is_rejected() {
		let mut env = Environment::new();
		assert_eq!(env.bind(Macro::default()).unwrap_err(), EnvironmentError::EmptyMacroName);
	}

	#[test]
	fn survives_rehash() {
		let mut env = Environment::new();
		for i in 0..1000 {
			env.bind(named(&format!("M{i}"))).unwrap();
		}
		for i in 0..1000 {
			assert!(env.resolve(format!("M{i}").as_bytes()).is_some(), "M{i} lost");
		}
		assert!(env.resolve(b"M1000").is_none());
	}

	#[test]
	fn builtins_are_not_stored() {
		assert!(Environment::is_builtin_macro(b"__LINE__"));
		assert!(Environment::is_builtin_macro(b"__FILE__"));
		assert!(!Environment::is_builtin_macro(b"__line__"));
		assert!(!Environment::is_builtin_macro(b"LINE"));
		let env = Environment::new();
		assert!(env.resolve(b"__LINE__").is_none());
	}
}
