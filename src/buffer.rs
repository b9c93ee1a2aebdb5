//! Pending-token buffers.
//!
//! After a macro expands, its rewritten body is queued here and read back
//! before anything else is lexed; the frame remembers which macro produced
//! it so that macro cannot expand again from its own output. Look-ahead
//! pushback uses the same mechanism with no blocking macro.
//!
//! Frames are compressed: tokens pushed without a new blocking macro are
//! prepended to the top frame instead of opening a fresh one, which keeps
//! the stack depth proportional to the expansion nesting rather than to
//! the token count.

use crate::macros::Macro;
use crate::token::PPToken;
use std::collections::VecDeque;

struct Frame {
	tokens: VecDeque<PPToken>,
	/// The macro whose expansion filled this frame; blocked from
	/// re-expanding while the frame is alive.
	blocking_macro: Option<Macro>,
}

#[derive(Default)]
pub struct TokenBufferStack {
	frames: Vec<Frame>,
}

impl TokenBufferStack {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn depth(&self) -> usize {
		self.frames.len()
	}

	pub fn is_empty(&self) -> bool {
		self.frames.is_empty()
	}

	/// Queue tokens to be read next. With a blocking macro (or an empty
	/// stack) this opens a new frame, capped at `max_depth`; otherwise the
	/// tokens are prepended to the top frame.
	pub fn push<I>(&mut self, tokens: I, blocking_macro: Option<Macro>, max_depth: usize)
	where
		I: IntoIterator<Item = PPToken>,
	{
		if blocking_macro.is_some() || self.frames.is_empty() {
			if self.frames.len() > max_depth {
				return;
			}
			self.frames.push(Frame { tokens: tokens.into_iter().collect(), blocking_macro });
		} else {
			let top = self.frames.last_mut().expect("non-empty stack");
			let mut queued: VecDeque<PPToken> = tokens.into_iter().collect();
			while let Some(tk) = queued.pop_back() {
				top.tokens.push_front(tk);
			}
		}
	}

	/// Next pending token, if any. A frame drained by the previous call is
	/// only discarded here, on the following read: the token most recently
	/// handed out may itself mention the macro that produced it, and that
	/// macro has to stay blocked while the token is being handled.
	pub fn next(&mut self) -> Option<PPToken> {
		loop {
			let top = self.frames.last_mut()?;
			match top.tokens.pop_front() {
				Some(tk) => return Some(tk),
				None => {
					self.frames.pop();
				}
			}
		}
	}

	/// Is `name` the name of any macro still being read back?
	pub fn is_blocked(&self, name: &[u8]) -> bool {
		self.frames
			.iter()
			.any(|frame| frame.blocking_macro.as_ref().is_some_and(|m| m.name.as_bytes() == name))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::token::{Kind, SourceBytes};

	fn ident(text: &str) -> PPToken {
		let mut tk = PPToken::with_source(SourceBytes::from(text.as_bytes()));
		tk.kind = Kind::Identifier;
		tk.byte_len = text.len() as u32;
		tk
	}

	fn named(name: &str) -> Macro {
		Macro { name: name.into(), ..Macro::default() }
	}

	#[test]
	fn fifo_within_a_frame() {
		let mut stack = TokenBufferStack::new();
		stack.push([ident("a"), ident("b")], None, 16);
		assert_eq!(stack.next().unwrap().text(), b"a");
		assert_eq!(stack.next().unwrap().text(), b"b");
		assert!(stack.next().is_none());
	}

	#[test]
	fn pushback_prepends_to_top_frame() {
		let mut stack = TokenBufferStack::new();
		stack.push([ident("body")], Some(named("M")), 16);
		stack.push([ident("x"), ident("y")], None, 16);
		assert_eq!(stack.depth(), 1);
		assert_eq!(stack.next().unwrap().text(), b"x");
		assert_eq!(stack.next().unwrap().text(), b"y");
		assert_eq!(stack.next().unwrap().text(), b"body");
	}

	#[test]
	fn blocking_survives_until_after_last_token_is_read() {
		let mut stack = TokenBufferStack::new();
		stack.push([ident("m")], Some(named("M")), 16);
		let last = stack.next().unwrap();
		assert_eq!(last.text(), b"m");
		// The frame is drained but still on the stack: M stays blocked
		// while `m` is being handled.
		assert!(stack.is_blocked(b"M"));
		assert!(stack.next().is_none());
		assert!(!stack.is_blocked(b"M"));
	}

	#[test]
	fn nested_frames_block_independently() {
		let mut stack = TokenBufferStack::new();
		stack.push([ident("a")], Some(named("A")), 16);
		stack.push([ident("b")], Some(named("B")), 16);
		assert!(stack.is_blocked(b"A"));
		assert!(stack.is_blocked(b"B"));
		assert!(!stack.is_blocked(b"C"));
	}

	#[test]
	fn depth_cap_drops_overflow() {
		let mut stack = TokenBufferStack::new();
		for _ in 0..4 {
			stack.push([ident("x")], Some(named("M")), 2);
		}
		assert_eq!(stack.depth(), 3);
	}
}
