//! Include-guard discovery.
//!
//! A small observer the driver feeds with hints while it walks the file.
//! It recognises exactly the canonical idiom — `#ifndef X` first, a
//! matching `#define X` at depth one, the closing `#endif` back at depth
//! zero, nothing but comments and line markers around it — and anything
//! else permanently disqualifies the file.

use crate::token::{Kind, PPToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeGuardState {
	/// No valid guard is possible any more.
	NoGuard,
	/// Initial state, before the first interesting token.
	BeforeIfndef,
	/// Saw `#ifndef X`; holding the candidate name.
	AfterIfndef,
	/// Saw the matching `#define X` inside the `#ifndef` block.
	AfterDefine,
	/// Saw the `#endif` belonging to the `#ifndef`.
	AfterEndif,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeGuardHint {
	/// Anything that is not a comment, `#ifndef`, `#define` or `#endif`.
	OtherToken,
	Ifndef,
	Define,
	Endif,
}

#[derive(Debug)]
pub struct IncludeGuardTracker {
	state: IncludeGuardState,
	name: Vec<u8>,
}

impl Default for IncludeGuardTracker {
	fn default() -> Self {
		Self::new()
	}
}

impl IncludeGuardTracker {
	pub fn new() -> Self {
		Self { state: IncludeGuardState::BeforeIfndef, name: Vec::new() }
	}

	pub fn state(&self) -> IncludeGuardState {
		self.state
	}

	/// The guard name, if the input so far still matches the idiom. Only
	/// meaningful at end of input.
	pub fn guard_name(&self) -> Option<&[u8]> {
		match self.state() {
			IncludeGuardState::AfterDefine | IncludeGuardState::AfterEndif => Some(&self.name),
			_ => None,
		}
	}

	/// Advance on one hint; `id_token` is the identifier expected after
	/// `#ifndef` or `#define`.
	pub fn update(&mut self, hint: IncludeGuardHint, id_token: Option<&PPToken>) {
		use IncludeGuardHint as Hint;
		use IncludeGuardState as State;

		let state = self.state();
		// The two hot no-op cases: disqualified files, and ordinary tokens
		// between the guard's #define and its #endif.
		if state == State::NoGuard {
			return;
		}
		if state == State::AfterDefine && hint == Hint::OtherToken {
			return;
		}

		self.state = match state {
			State::NoGuard => State::NoGuard,
			State::BeforeIfndef => match (hint, id_token) {
				(Hint::Ifndef, Some(id)) if id.is(Kind::Identifier) => {
					self.name = id.text().to_vec();
					State::AfterIfndef
				}
				_ => State::NoGuard,
			},
			State::AfterIfndef => match (hint, id_token) {
				(Hint::Define, Some(id)) if id.is(Kind::Identifier) && id.text() == &self.name[..] => {
					State::AfterDefine
				}
				_ => State::AfterIfndef,
			},
			State::AfterDefine => match hint {
				Hint::Endif => State::AfterEndif,
				_ => State::AfterDefine,
			},
			State::AfterEndif => {
				self.name.clear();
				State::NoGuard
			}
		};
	}
}
