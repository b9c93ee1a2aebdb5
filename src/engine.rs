//! The preprocessor proper: directive dispatch, conditional compilation,
//! macro expansion with rescanning and self-reference blocking, and the
//! byte-exact output stream with line markers and expansion sections.
//!
//! One [`Preprocessor`] handles one translation unit at a time. It owns a
//! per-run [`DriverState`] which is swapped out wholesale when a `#if`
//! condition or a macro-form `#include` argument needs a nested run over a
//! slice of the current source.

use crate::buffer::TokenBufferStack;
use crate::client::{Client, IncludeType, MacroArgumentReference};
use crate::environment::Environment;
use crate::error::{Diagnostic, DiagnosticKind};
use crate::expr::{ExpressionEvaluator, Value};
use crate::guard::{IncludeGuardHint, IncludeGuardTracker};
use crate::lexer::{self, Lexer};
use crate::macros::Macro;
use crate::token::{Kind, PPToken, SourceBytes};
use crate::util;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Synthetic file name for host-injected configuration buffers.
pub const CONFIGURATION_FILE_NAME: &str = "<configuration>";

/// Hard limits acting as structural back-pressure; none of them aborts the
/// run, they only stop the offending construct.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
	/// `#if` nesting depth.
	pub max_conditional_depth: usize,
	/// Live token-buffer frames.
	pub max_token_buffer_depth: usize,
	/// Tokens emitted by one top-level expansion.
	pub max_token_expansion_count: usize,
}

impl Default for Limits {
	fn default() -> Self {
		Self { max_conditional_depth: 512, max_token_buffer_depth: 16_000, max_token_expansion_count: 5_000 }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExpansionStatus {
	NotExpanding,
	ReadyForExpansion,
	Expanding,
	JustFinishedExpansion,
}

/// All per-run mutable state, bundled so nested runs can swap it out and
/// back with `mem::replace` instead of juggling individual flags.
struct DriverState {
	current_file: String,
	source: SourceBytes,
	lexer: Lexer,
	skipping: Vec<bool>,
	true_test: Vec<bool>,
	if_level: usize,
	buffers: TokenBufferStack,
	in_directive: bool,
	mark_expanded_tokens: bool,
	no_lines: bool,
	in_condition: bool,
	bytes_offset_ref: u32,
	utf16_offset_ref: u32,
	line_ref: u32,
	result: Vec<u8>,
	expansion_status: ExpansionStatus,
	expansion_result: Vec<u8>,
	/// Per expanded token: (line, column) for source-backed tokens,
	/// (0, 0) for generated ones.
	expanded_tokens_info: Vec<(u32, u32)>,
	guard: IncludeGuardTracker,
}

impl DriverState {
	fn new(file_name: &str, source: SourceBytes, limits: &Limits) -> Self {
		let lexer = Lexer::new(source.clone());
		Self {
			current_file: file_name.to_owned(),
			source,
			lexer,
			skipping: vec![false; limits.max_conditional_depth],
			true_test: vec![false; limits.max_conditional_depth],
			if_level: 0,
			buffers: TokenBufferStack::new(),
			in_directive: false,
			mark_expanded_tokens: true,
			no_lines: false,
			in_condition: false,
			bytes_offset_ref: 0,
			utf16_offset_ref: 0,
			line_ref: 1,
			result: Vec::new(),
			expansion_status: ExpansionStatus::NotExpanding,
			expansion_result: Vec::new(),
			expanded_tokens_info: Vec::new(),
			guard: IncludeGuardTracker::new(),
		}
	}
}

pub struct Preprocessor<'a> {
	client: Option<&'a mut dyn Client>,
	env: &'a mut Environment,
	expand_function_like_macros: bool,
	keep_comments: bool,
	reserved_identifier: Option<fn(&[u8]) -> bool>,
	limits: Limits,
	state: DriverState,
}

impl<'a> Preprocessor<'a> {
	pub fn new(client: Option<&'a mut dyn Client>, env: &'a mut Environment) -> Self {
		let limits = Limits::default();
		Self {
			client,
			env,
			expand_function_like_macros: true,
			keep_comments: false,
			reserved_identifier: None,
			state: DriverState::new("", SourceBytes::from(&[][..]), &limits),
			limits,
		}
	}

	pub fn expand_function_like_macros(&self) -> bool {
		self.expand_function_like_macros
	}

	pub fn set_expand_function_like_macros(&mut self, expand: bool) {
		self.expand_function_like_macros = expand;
	}

	pub fn keep_comments(&self) -> bool {
		self.keep_comments
	}

	pub fn set_keep_comments(&mut self, keep: bool) {
		self.keep_comments = keep;
	}

	/// Host-specific identifiers (e.g. moc-style keywords) the engine must
	/// never expand; nothing is reserved by default.
	pub fn set_reserved_identifier_predicate(&mut self, predicate: Option<fn(&[u8]) -> bool>) {
		self.reserved_identifier = predicate;
	}

	pub fn limits(&self) -> Limits {
		self.limits
	}

	pub fn set_limits(&mut self, limits: Limits) {
		self.limits = limits;
	}

	/// Preprocess with line markers and expansion marking on.
	pub fn run(&mut self, file_name: &str, source: &[u8]) -> Vec<u8> {
		self.run_opts(file_name, source, false, true)
	}

	pub fn run_opts(
		&mut self, file_name: &str, source: &[u8], no_lines: bool, mark_expanded_tokens: bool,
	) -> Vec<u8> {
		let (mut out, guard_name) =
			self.preprocess(file_name, SourceBytes::from(source), no_lines, mark_expanded_tokens, false, 0, 0, 1);
		if let Some(name) = guard_name {
			if let Some(client) = self.client.as_mut() {
				client.include_guard_detected(&name);
			}
		}
		if !out.ends_with(b"\n") {
			out.push(b'\n');
		}
		out
	}

	#[allow(clippy::too_many_arguments)]
	fn preprocess(
		&mut self, file_name: &str, source: SourceBytes, no_lines: bool, mark_expanded_tokens: bool,
		in_condition: bool, bytes_offset_ref: u32, utf16_offset_ref: u32, line_ref: u32,
	) -> (Vec<u8>, Option<Vec<u8>>) {
		if source.is_empty() {
			return (Vec::new(), None);
		}

		let mut state = DriverState::new(file_name, source, &self.limits);
		state.no_lines = no_lines;
		state.mark_expanded_tokens = mark_expanded_tokens;
		state.in_condition = in_condition;
		state.bytes_offset_ref = bytes_offset_ref;
		state.utf16_offset_ref = utf16_offset_ref;
		state.line_ref = line_ref;
		state.lexer.set_scan_comment_tokens(self.keep_comments);

		let saved_state = std::mem::replace(&mut self.state, state);
		let saved_file = std::mem::replace(&mut self.env.current_file, file_name.to_owned());
		let saved_line = std::mem::replace(&mut self.env.current_line, 1);

		if !self.state.no_lines {
			self.generate_output_line_marker(1);
		}

		let mut tk = PPToken::with_source(self.state.source.clone());
		loop {
			self.lex(&mut tk);

			// Track the start and end of expansion cycles.
			self.track_expansion_cycles(&mut tk);

			let mut macro_expanded = false;
			match self.state.expansion_status {
				ExpansionStatus::Expanding => {
					// Remember where each expanded token came from so the
					// expansion section can map it back.
					let mut tracked_line = 0;
					let mut tracked_column = 0;
					if tk.expanded && !tk.generated {
						tracked_line = tk.line;
						tracked_column = compute_distance(&tk, true) as u32;
					}
					self.state.expanded_tokens_info.push((tracked_line, tracked_column));
				}
				ExpansionStatus::JustFinishedExpansion => {
					self.state.expansion_status = ExpansionStatus::NotExpanding;
					macro_expanded = true;
				}
				_ => {}
			}

			self.synchronize_output_lines(&tk, macro_expanded);
			self.enforce_spacing(&tk, macro_expanded);
			self.current_output_buffer().extend_from_slice(tk.text());

			if tk.is(Kind::Eof) {
				break;
			}
		}

		let guard_name = self.state.guard.guard_name().map(<[u8]>::to_vec);
		let finished = std::mem::replace(&mut self.state, saved_state);
		self.env.current_file = saved_file;
		self.env.current_line = saved_line;
		(finished.result, guard_name)
	}

	fn skipping(&self) -> bool {
		self.state.skipping[self.state.if_level]
	}

	fn is_reserved(&self, name: &[u8]) -> bool {
		self.reserved_identifier.is_some_and(|predicate| predicate(name))
	}

	fn update_guard(&mut self, hint: IncludeGuardHint, id_token: Option<&PPToken>) {
		// Include guards can never occur inside pp-conditions.
		if self.state.in_condition {
			return;
		}
		self.state.guard.update(hint, id_token);
	}

	fn diagnose(&mut self, kind: DiagnosticKind, tk: &PPToken) {
		let diag = Diagnostic {
			kind,
			file: self.env.current_file.clone(),
			line: tk.line,
			byte_offset: tk.byte_offset + self.state.bytes_offset_ref,
			utf16_offset: tk.utf16_offset + self.state.utf16_offset_ref,
		};
		warn!("{diag}");
		if let Some(client) = self.client.as_mut() {
			client.diagnostic(&diag);
		}
	}

	/// Read the next token: pending buffers first, then the lexer; then
	/// reclassify — directives are dispatched, skipped regions discarded,
	/// identifiers considered for expansion.
	fn lex(&mut self, tk: &mut PPToken) {
		'again: loop {
			*tk = match self.state.buffers.next() {
				Some(buffered) => buffered,
				None => self.state.lexer.scan(),
			};
			// Line numbers are relative to where an embedded run started.
			tk.line += self.state.line_ref - 1;

			loop {
				if self.state.in_directive {
					return;
				}
				if tk.newline && tk.is(Kind::Pound) {
					self.handle_directive(tk);
					continue;
				}
				if tk.newline && self.skipping() {
					// Discard the rest of the logical line.
					self.state.in_directive = true;
					loop {
						self.lex(tk);
						if !tk.is_continuation() {
							break;
						}
					}
					self.state.in_directive = false;
					continue;
				}
				if tk.is(Kind::Identifier) && !self.is_reserved(tk.text()) {
					self.update_guard(IncludeGuardHint::OtherToken, None);
					if self.state.in_condition && tk.text() == b"defined" {
						self.handle_defined(tk);
						return;
					}
					self.synchronize_output_lines(tk, false);
					if self.handle_identifier(tk) {
						continue 'again;
					}
					return;
				}
				if !tk.kind.is_comment() && !tk.is(Kind::Eof) && !tk.is(Kind::Marker) {
					self.update_guard(IncludeGuardHint::OtherToken, None);
				}
				return;
			}
		}
	}

	fn push_token(&mut self, tk: &PPToken) {
		self.state.buffers.push([tk.clone()], None, self.limits.max_token_buffer_depth);
	}

	/// `defined X` / `defined(X)` inside a condition run: resolve now and
	/// replace with `0`/`1` — the operand must not be macro-expanded.
	fn handle_defined(&mut self, tk: &mut PPToken) {
		let saved = self.state.in_directive;
		self.state.in_directive = true;
		let lineno = tk.line;
		self.lex(tk); // consume `defined`
		let lparen_seen = tk.is(Kind::LParen);
		if lparen_seen {
			self.lex(tk); // consume `(`
		}
		if !tk.is(Kind::Identifier) {
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			self.state.in_directive = saved;
			return;
		}
		let mut id_token = tk.clone();
		loop {
			self.lex(tk);
			if !tk.is(Kind::PoundPound) {
				break;
			}
			self.lex(tk);
			if tk.is(Kind::Identifier) {
				id_token = generate_concatenated(&id_token, tk);
			} else {
				break;
			}
			if !tk.is_continuation() {
				break;
			}
		}
		if lparen_seen && tk.is(Kind::RParen) {
			self.lex(tk);
		}
		self.push_token(tk);

		let name = id_token.text().to_vec();
		let defined = self.macro_definition_check(
			&name,
			id_token.byte_offset + self.state.bytes_offset_ref,
			id_token.utf16_offset + self.state.utf16_offset_ref,
			id_token.line,
		);
		*tk = generate_token(Kind::Number, if defined { b"1" } else { b"0" }, lineno, false);
		self.state.in_directive = saved;
	}

	/// Resolve `name` as a `defined`-style check, reporting the outcome.
	/// The four built-in names count as defined.
	fn macro_definition_check(&mut self, name: &[u8], bytes_offset: u32, utf16_offset: u32, line: u32) -> bool {
		match self.env.resolve(name) {
			Some(mac) => {
				if let Some(client) = self.client.as_mut() {
					client.defined_check_passed(bytes_offset, utf16_offset, line, mac);
				}
				true
			}
			None => {
				if Environment::is_builtin_macro(name) {
					return true;
				}
				if let Some(client) = self.client.as_mut() {
					client.defined_check_failed(bytes_offset, utf16_offset, name);
				}
				false
			}
		}
	}

	/// Attempt macro expansion on an identifier token. Returns true when
	/// the token was consumed and replaced by buffered expansion output.
	fn handle_identifier(&mut self, tk: &mut PPToken) -> bool {
		let saved = self.state.in_directive;
		self.state.in_directive = !tk.expanded;
		let result = self.handle_identifier_inner(tk);
		self.state.in_directive = saved;
		result
	}

	fn handle_identifier_inner(&mut self, tk: &mut PPToken) -> bool {
		let name = tk.text().to_vec();

		// The built-in names are intercepted here; they never live in the
		// environment.
		if name.len() == 8 && name.starts_with(b"__") {
			let text: Option<Vec<u8>> = match &name[..] {
				b"__LINE__" => Some(tk.line.to_string().into_bytes()),
				b"__FILE__" => Some(format!("\"{}\"", self.env.current_file).into_bytes()),
				b"__DATE__" => Some(format!("\"{}\"", chrono::Utc::now().format("%b %e %Y")).into_bytes()),
				b"__TIME__" => Some(format!("\"{}\"", chrono::Utc::now().format("%H:%M:%S")).into_bytes()),
				_ => None,
			};
			if let Some(text) = text {
				let kind = if name == b"__LINE__" { Kind::Number } else { Kind::StringLiteral };
				let mut new_tk = generate_token(kind, &text, tk.line, false);
				new_tk.newline = tk.newline;
				new_tk.whitespace = tk.whitespace;
				*tk = new_tk;
				return false;
			}
		}

		let resolved = self.env.resolve(&name).cloned();

		// Inside a condition every identifier is implicitly a definedness
		// probe; report it as such.
		if self.state.in_condition {
			let bytes_offset = tk.byte_offset + self.state.bytes_offset_ref;
			let utf16_offset = tk.utf16_offset + self.state.utf16_offset_ref;
			if let Some(mac) = &resolved {
				if let Some(client) = self.client.as_mut() {
					client.defined_check_passed(bytes_offset, utf16_offset, tk.line, mac);
				}
			} else if !Environment::is_builtin_macro(&name) {
				if let Some(client) = self.client.as_mut() {
					client.defined_check_failed(bytes_offset, utf16_offset, &name);
				}
			}
		}

		let Some(mac) = resolved else { return false };
		if tk.expanded && !self.state.buffers.is_empty() && self.state.buffers.is_blocked(&name) {
			return false;
		}
		debug!(name = %mac.name, line = tk.line, "expanding");

		let id_tk = tk.clone();

		// Generated tokens have no source line of their own; they inherit
		// a running reference line seeded from the invocation.
		let mut base_line = (id_tk.line + 1).saturating_sub(self.state.line_ref);

		let mut body = mac.body.clone();

		// A marker planted by an enclosing expansion may sit between the
		// macro name and its argument list; stash it and put it back
		// behind the rewritten body.
		let mut old_marker_tk: Option<PPToken> = None;

		if mac.function_like {
			if !self.expand_function_like_macros && self.state.expansion_status != ExpansionStatus::Expanding {
				let (bytes_offset, utf16_offset, line) = (
					self.state.bytes_offset_ref + id_tk.byte_offset,
					self.state.utf16_offset_ref + id_tk.utf16_offset,
					id_tk.line,
				);
				if let Some(client) = self.client.as_mut() {
					client.macro_reference(bytes_offset, utf16_offset, line, &mac);
				}
				return false;
			}

			let mut all_arg_tokens: Vec<Vec<PPToken>> = Vec::new();
			let mut consumed: Vec<PPToken> = Vec::new();
			let mut has_args = self.collect_actual_arguments(tk, &mut all_arg_tokens, &mut consumed);

			if !has_args
				&& !tk.has_source()
				&& self.state.mark_expanded_tokens
				&& matches!(
					self.state.expansion_status,
					ExpansionStatus::Expanding | ExpansionStatus::ReadyForExpansion
				) {
				old_marker_tk = Some(tk.clone());
				all_arg_tokens.clear();
				consumed.clear();
				has_args = self.collect_actual_arguments(tk, &mut all_arg_tokens, &mut consumed);
			}

			if has_args && tk.is(Kind::Eof) {
				// Ran off the end of input inside the call: replay what
				// was scanned and leave the name unexpanded.
				self.diagnose(DiagnosticKind::UnterminatedArgumentList, &id_tk);
				self.state.buffers.push(consumed, None, self.limits.max_token_buffer_depth);
				if let Some(marker) = old_marker_tk {
					self.push_token(&marker);
				}
				*tk = id_tk;
				return false;
			}

			let mut has_matching_args = false;
			if has_args {
				let expected = mac.formals.len();
				if mac.variadic && all_arg_tokens.len() + 1 == expected {
					all_arg_tokens.push(Vec::new());
				}
				let actual = all_arg_tokens.len();
				if expected == actual
					|| (mac.variadic && actual + 1 > expected)
					// `#define foo()` invoked as `foo()`.
					|| (expected == 0 && actual == 1 && all_arg_tokens[0].is_empty())
				{
					has_matching_args = true;
				}
			}

			if !has_args || !has_matching_args {
				if has_args {
					self.diagnose(DiagnosticKind::ArgumentMismatch, &id_tk);
				}
				consumed.push(tk.clone());
				self.state.buffers.push(consumed, None, self.limits.max_token_buffer_depth);
				if let Some(marker) = old_marker_tk {
					self.push_token(&marker);
				}
				*tk = id_tk;
				return false;
			}

			if self.client.is_some() && !id_tk.generated {
				// One reference per argument, empty ones included — their
				// count matters, as in foo(,).
				let mut arg_refs: Vec<MacroArgumentReference> = Vec::new();
				for arg in &all_arg_tokens {
					if arg.is_empty() {
						arg_refs.push(MacroArgumentReference::default());
					} else {
						let first = &arg[0];
						let last = &arg[arg.len() - 1];
						arg_refs.push(MacroArgumentReference::new(
							self.state.bytes_offset_ref + first.byte_offset,
							last.bytes_end().saturating_sub(first.byte_offset),
							self.state.utf16_offset_ref + first.utf16_offset,
							last.utf16_end().saturating_sub(first.utf16_offset),
						));
					}
				}
				let (bytes_offset, utf16_offset, line) = (
					self.state.bytes_offset_ref + id_tk.byte_offset,
					self.state.utf16_offset_ref + id_tk.utf16_offset,
					id_tk.line,
				);
				if let Some(client) = self.client.as_mut() {
					client.expansion_started(bytes_offset, utf16_offset, line, &mac, &arg_refs);
				}
			}

			self.expand_function_like_body(&mac, &mut body, &all_arg_tokens, &mut base_line);
		} else if self.client.is_some() && !id_tk.generated {
			let (bytes_offset, utf16_offset, line) = (
				self.state.bytes_offset_ref + id_tk.byte_offset,
				self.state.utf16_offset_ref + id_tk.utf16_offset,
				id_tk.line,
			);
			if let Some(client) = self.client.as_mut() {
				client.expansion_started(bytes_offset, utf16_offset, line, &mac, &[]);
			}
		}

		if body.is_empty() {
			if self.state.mark_expanded_tokens
				&& matches!(
					self.state.expansion_status,
					ExpansionStatus::NotExpanding | ExpansionStatus::JustFinishedExpansion
				) {
				// Keep downstream columns aligned: cover the invocation's
				// width with a plain whitespace-only token.
				let width = id_tk.byte_len as usize + compute_distance(&id_tk, false);
				let content = vec![b' '; width];
				let mut placeholder = generate_token(Kind::Identifier, &content, id_tk.line, false);
				placeholder.whitespace = true;
				placeholder.expanded = false;
				placeholder.generated = false;
				body.push(placeholder);
			}
		} else {
			// The first body token replaces the invocation, so it inherits
			// its layout flags.
			body[0].whitespace = id_tk.whitespace;
			body[0].newline = id_tk.newline;

			// Expansions are tracked top-level: one begin/end pair per
			// direct macro use in the source, covering all its recursive
			// re-expansions.
			if self.state.mark_expanded_tokens {
				match self.state.expansion_status {
					ExpansionStatus::NotExpanding | ExpansionStatus::JustFinishedExpansion => {
						let marker = PPToken::marker(id_tk.byte_offset, id_tk.byte_len, id_tk.line);
						body.insert(0, marker.clone());
						body.push(marker);
						self.state.expansion_status = ExpansionStatus::ReadyForExpansion;
					}
					ExpansionStatus::ReadyForExpansion | ExpansionStatus::Expanding => {
						if let Some(marker) = old_marker_tk.take() {
							body.push(marker);
						}
					}
				}
			}
		}

		self.state.buffers.push(body, Some(mac.clone()), self.limits.max_token_buffer_depth);

		if !id_tk.generated {
			if let Some(client) = self.client.as_mut() {
				client.expansion_stopped(id_tk.byte_offset, &mac);
			}
		}

		true
	}

	/// Substitute formals in a function-like body: `#` stringizes, `##`
	/// pastes, the variadic tail folds into its formal.
	fn expand_function_like_body(
		&mut self, mac: &Macro, body: &mut Vec<PPToken>, actuals: &[Vec<PPToken>], base_line: &mut u32,
	) {
		let cap = self.limits.max_token_expansion_count;
		let mut expanded: Vec<PPToken> = Vec::new();
		let body_len = body.len();
		let mut i = 0;

		while i < body_len && expanded.len() < cap {
			let expanded_len = expanded.len();
			let mut body_tk = body[i].clone();

			if body_tk.is(Kind::Identifier) {
				let id = body_tk.text().to_vec();
				let formals_len = mac.formals.len();
				let mut j = 0;
				while j < formals_len && expanded.len() < cap {
					if mac.formals[j].as_bytes() == &id[..] {
						let mut actuals_for_param: Vec<PPToken> = actuals.get(j).cloned().unwrap_or_default();
						let mut lineno = *base_line;

						// The variadic formal swallows every remaining
						// argument, commas restored.
						if id == b"__VA_ARGS__" || (mac.variadic && j + 1 == formals_len) {
							for tail in actuals.iter().skip(j + 1) {
								actuals_for_param.push(generate_token(Kind::Comma, b",", lineno, false));
								actuals_for_param.extend(tail.iter().cloned());
							}
						}

						if i > 0 && body[i - 1].is(Kind::Pound) {
							// Stringize: single spaces where the actual
							// had whitespace, quotes and backslashes
							// escaped.
							let mut enclosed: Vec<u8> = Vec::new();
							for (k, t) in actuals_for_param.iter().enumerate() {
								if k == 0 {
									lineno = t.line;
								} else if t.whitespace {
									enclosed.push(b' ');
								}
								enclosed.extend_from_slice(t.text());
							}
							let escaped = escape_for_string_literal(&enclosed);
							expanded.push(generate_token(Kind::StringLiteral, &escaped, lineno, true));
						} else {
							let actuals_len = actuals_for_param.len();
							for (k, actual) in actuals_for_param.into_iter().enumerate() {
								let mut actual = actual;
								actual.expanded = true;
								if k == 0 {
									actual.whitespace = body_tk.whitespace;
								}
								if k + 1 == actuals_len {
									lineno = actual.line;
								}
								expanded.push(actual);
							}
						}

						*base_line = lineno;
						break;
					}
					j += 1;
				}

				if j == formals_len {
					// Not a formal; goes out as a generated body token.
					body_tk.generated = true;
					body_tk.line = *base_line;
					expanded.push(body_tk);
				}
			} else if !body_tk.is(Kind::Pound) && !body_tk.is(Kind::PoundPound) {
				body_tk.generated = true;
				body_tk.line = *base_line;
				expanded.push(body_tk);
			}

			if i > 1 && body[i - 1].is(Kind::PoundPound) && expanded_len >= 1 && expanded.len() > expanded_len {
				let right = expanded.remove(expanded_len);
				let left = expanded[expanded_len - 1].clone();
				expanded[expanded_len - 1] = generate_concatenated(&left, &right);
			}

			i += 1;
		}

		if i < body_len {
			// Cap hit: emit the unprocessed remainder literally.
			let at = body[i].clone();
			self.diagnose(DiagnosticKind::ExpansionOverflow, &at);
			expanded.extend(body[i..].iter().cloned());
		}

		*body = expanded;
	}

	/// Collect the parenthesised arguments of a function-like invocation.
	/// Everything consumed past the name lands in `consumed` so a failed
	/// match can replay it. Returns false when no `(` follows; on return
	/// `tk` holds the closing `)`, the offending token, or EOF.
	fn collect_actual_arguments(
		&mut self, tk: &mut PPToken, actuals: &mut Vec<Vec<PPToken>>, consumed: &mut Vec<PPToken>,
	) -> bool {
		self.lex(tk); // consume the macro name

		let mut last_comment_is_line = false;
		while self.scan_comment(tk) {
			last_comment_is_line = tk.is(Kind::LineComment);
			self.lex(tk);
		}
		if last_comment_is_line {
			// A kept line comment would swallow the expansion that is
			// about to land after it.
			self.maybe_start_output_line();
		}

		if !tk.is(Kind::LParen) {
			return false;
		}
		consumed.push(tk.clone());

		let mut tokens: Vec<PPToken> = Vec::new();
		self.lex(tk);
		self.scan_actual_argument(tk, &mut tokens, consumed);
		actuals.push(tokens);

		while tk.is(Kind::Comma) {
			consumed.push(tk.clone());
			self.lex(tk);
			let mut tokens: Vec<PPToken> = Vec::new();
			self.scan_actual_argument(tk, &mut tokens, consumed);
			actuals.push(tokens);
		}

		true
	}

	fn scan_actual_argument(&mut self, tk: &mut PPToken, tokens: &mut Vec<PPToken>, consumed: &mut Vec<PPToken>) {
		let mut depth = 0usize;

		while !tk.is(Kind::Eof) {
			if tk.is(Kind::LParen) {
				depth += 1;
			} else if tk.is(Kind::RParen) {
				if depth == 0 {
					break;
				}
				depth -= 1;
			} else if depth == 0 && tk.is(Kind::Comma) {
				break;
			}

			consumed.push(tk.clone());
			if self.keep_comments && tk.is(Kind::LineComment) {
				// A line comment cannot survive mid-expansion; turn it
				// into a block comment, inner `*/` defanged.
				let comment = line_comment_to_block(tk.text());
				tokens.push(generate_token(Kind::Comment, &comment, tk.line, false));
			} else {
				tokens.push(tk.clone());
			}

			self.lex(tk);
		}
	}

	fn handle_directive(&mut self, tk: &mut PPToken) {
		self.state.in_directive = true;
		let pound_token = tk.clone();
		self.lex(tk); // the directive name

		if tk.newline && !tk.joined {
			// Null directive.
			self.state.in_directive = false;
			return;
		}

		if tk.is(Kind::Identifier) {
			let directive = tk.text().to_vec();
			if !self.skipping() && directive == b"define" {
				self.handle_define_directive(tk);
			} else if directive == b"ifndef" {
				self.handle_ifdef_directive(true, tk);
			} else if directive == b"endif" {
				self.handle_endif_directive(tk, &pound_token);
			} else {
				self.update_guard(IncludeGuardHint::OtherToken, None);
				if !self.skipping() && directive == b"undef" {
					self.handle_undef_directive(tk);
				} else if !self.skipping() && (directive == b"include" || directive == b"import") {
					self.handle_include_directive(tk, false);
				} else if !self.skipping() && directive == b"include_next" {
					self.handle_include_directive(tk, true);
				} else if directive == b"if" {
					self.handle_if_directive(tk);
				} else if directive == b"ifdef" {
					self.handle_ifdef_directive(false, tk);
				} else if directive == b"else" {
					self.handle_else_directive(tk, &pound_token);
				} else if directive == b"elif" {
					self.handle_elif_directive(tk, &pound_token);
				} else if matches!(&directive[..], b"line" | b"error" | b"pragma") {
					debug!(directive = %String::from_utf8_lossy(&directive), "directive tolerated and ignored");
				}
			}
		}

		self.skip_directive(tk);
		self.state.in_directive = false;
	}

	/// Consume (and, for comments, emit) the rest of the directive line.
	fn skip_directive(&mut self, tk: &mut PPToken) {
		while tk.is_continuation() {
			self.scan_comment(tk);
			self.lex(tk);
		}
	}

	fn scan_comment(&mut self, tk: &PPToken) -> bool {
		if !tk.kind.is_comment() {
			return false;
		}
		self.synchronize_output_lines(tk, false);
		self.enforce_spacing(tk, true);
		self.current_output_buffer().extend_from_slice(tk.text());
		true
	}

	fn consume_comments(&mut self, tk: &mut PPToken) -> bool {
		while self.scan_comment(tk) {
			self.lex(tk);
		}
		!tk.is(Kind::Eof)
	}

	fn handle_include_directive(&mut self, tk: &mut PPToken, include_next: bool) {
		self.state.lexer.set_scan_angle_string_literals(true);
		self.lex(tk); // consume the directive name; the path may be <...>
		self.state.lexer.set_scan_angle_string_literals(false);
		let line = tk.line;

		let included: Vec<u8> = if tk.is(Kind::StringLiteral) || tk.is(Kind::AngleStringLiteral) {
			let text = tk.text().to_vec();
			self.lex(tk); // consume the path token
			text
		} else {
			// Macro-form argument: expand the rest of the line and look
			// at what came out.
			self.expand_to_bytes(tk).0
		};
		let included = util::trim(&included);

		if included.is_empty() {
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return;
		}

		let mode = if include_next {
			IncludeType::Next
		} else if included[0] == b'"' {
			IncludeType::Local
		} else if included[0] == b'<' {
			IncludeType::Global
		} else {
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return;
		};

		let inner = if included.len() >= 2 && matches!(included[0], b'"' | b'<') {
			&included[1..included.len() - 1]
		} else {
			included
		};
		let path = String::from_utf8_lossy(inner).into_owned();
		debug!(%path, ?mode, line, "include requested");
		if let Some(client) = self.client.as_mut() {
			client.source_needed(self.env, line, &path, mode, &[]);
		}
	}

	fn handle_define_directive(&mut self, tk: &mut PPToken) {
		let define_offset = tk.byte_offset;
		self.lex(tk); // consume `define`
		if !self.consume_comments(tk) {
			return;
		}

		if !tk.is_continuation() || !tk.is(Kind::Identifier) {
			// No name on the directive line.
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return;
		}

		let mut mac = Macro {
			name: String::from_utf8_lossy(tk.text()).as_ref().into(),
			file_path: self.env.current_file.clone(),
			line: tk.line,
			byte_offset: tk.byte_offset,
			utf16_offset: tk.utf16_offset,
			..Macro::default()
		};
		let id_token = tk.clone();

		self.lex(tk);

		// Function-like iff `(` hugs the name.
		if tk.is_continuation() && tk.is(Kind::LParen) && !tk.whitespace {
			mac.function_like = true;

			self.lex(tk); // skip `(`
			if !self.consume_comments(tk) {
				return;
			}

			let mut has_identifier = false;
			if tk.is_continuation() && tk.is(Kind::Identifier) {
				has_identifier = true;
				mac.formals.push(String::from_utf8_lossy(tk.text()).as_ref().into());

				self.lex(tk);
				if !self.consume_comments(tk) {
					return;
				}

				while tk.is_continuation() && tk.is(Kind::Comma) {
					self.lex(tk);
					if !self.consume_comments(tk) {
						return;
					}

					if tk.is_continuation() && tk.is(Kind::Identifier) {
						mac.formals.push(String::from_utf8_lossy(tk.text()).as_ref().into());
						self.lex(tk);
						if !self.consume_comments(tk) {
							return;
						}
					} else {
						has_identifier = false;
					}
				}
			}

			if tk.is(Kind::Ellipsis) {
				mac.variadic = true;
				if !has_identifier {
					mac.formals.push("__VA_ARGS__".into());
				}
				self.lex(tk); // consume the ellipsis
				if !self.consume_comments(tk) {
					return;
				}
			}

			if tk.is_continuation() && tk.is(Kind::RParen) {
				self.lex(tk); // consume `)`
			}
		} else if self.state.if_level == 1 {
			self.update_guard(IncludeGuardHint::Define, Some(&id_token));
		}

		let mut body: Vec<PPToken> = Vec::new();
		let mut previous_bytes_offset = 0;
		let mut previous_utf16_offset = 0;
		let mut previous_line = 0;
		let mut macro_reference: Option<Macro> = None;
		while tk.is_continuation() {
			// Body tokens are expanded by definition; object-like bodies
			// are generated too, function-like ones only after formals
			// are substituted.
			tk.expanded = true;
			if !mac.function_like {
				tk.generated = true;
			}

			// No eager expansion inside a define, but macro names used in
			// the body are still worth reporting.
			if tk.is(Kind::Identifier) && self.client.is_some() {
				match self.env.resolve(tk.text()).cloned() {
					Some(reference) if !reference.function_like => {
						if let Some(client) = self.client.as_mut() {
							client.macro_reference(tk.byte_offset, tk.utf16_offset, tk.line, &reference);
						}
						macro_reference = None;
					}
					other => macro_reference = other,
				}
			} else if let Some(reference) = macro_reference.take() {
				// A function-like reference only counts if a `(` follows.
				if tk.is(Kind::LParen) {
					if let Some(client) = self.client.as_mut() {
						client.macro_reference(previous_bytes_offset, previous_utf16_offset, previous_line, &reference);
					}
				}
			}

			previous_bytes_offset = tk.byte_offset;
			previous_utf16_offset = tk.utf16_offset;
			previous_line = tk.line;

			if !self.scan_comment(tk) {
				body.push(tk.clone());
			}

			self.lex(tk);
		}

		if self.is_reserved(mac.name.as_bytes()) {
			// Reserved names keep their signature for display but must
			// never produce tokens.
			let decorated = mac.decorated_name();
			mac.definition_text = decorated.into_bytes();
		} else if !body.is_empty() {
			let source_len = self.state.source.len();
			let start = (body[0].byte_offset as usize).min(source_len);
			let end = (tk.byte_offset as usize).clamp(start, source_len);
			mac.definition_text = util::trim(&self.state.source[start..end]).to_vec();
			mac.body = body;
		}

		mac.length = tk.byte_offset.saturating_sub(define_offset);

		match self.env.bind(mac) {
			Ok(bound) => {
				let bound = bound.clone();
				if let Some(client) = self.client.as_mut() {
					client.macro_added(&bound);
				}
			}
			Err(err) => warn!("{err}"),
		}
	}

	/// Gather the rest of the logical line, run it through a nested
	/// preprocessing pass (condition mode), and hand back the bytes plus
	/// the last source token of the line.
	fn expand_to_bytes(&mut self, tk: &mut PPToken) -> (Vec<u8>, PPToken) {
		let line = tk.line;
		let bytes_begin = tk.byte_offset;
		let utf16_begin = tk.utf16_offset;
		let mut last_tk: Option<PPToken> = None;
		while tk.is_continuation() {
			last_tk = Some(tk.clone());
			self.lex(tk);
		}
		let Some(last_tk) = last_tk else {
			// Nothing on the line after the directive name.
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return (Vec::new(), tk.clone());
		};

		let source_len = self.state.source.len();
		let begin = (bytes_begin as usize).min(source_len);
		let end = (last_tk.bytes_end() as usize).clamp(begin, source_len);
		let condition = SourceBytes::from(&self.state.source[begin..end]);
		let file = self.state.current_file.clone();

		let (result, _) = self.preprocess(&file, condition, true, false, true, bytes_begin, utf16_begin, line);
		(result, last_tk)
	}

	fn eval_expression(&mut self, tk: &mut PPToken) -> (Value, PPToken) {
		let (expanded, last_tk) = self.expand_to_bytes(tk);
		let tokens = lexer::tokenize(SourceBytes::from(&expanded[..]));
		let client: Option<&mut dyn Client> = match &mut self.client {
			Some(c) => Some(&mut **c),
			None => None,
		};
		let value = ExpressionEvaluator::new(client, &*self.env, &tokens).evaluate();
		(value, last_tk)
	}

	fn handle_if_directive(&mut self, tk: &mut PPToken) {
		self.lex(tk); // consume `if`
		let (value, last_expression_token) = self.eval_expression(tk);

		if self.state.if_level + 1 >= self.limits.max_conditional_depth {
			self.diagnose(DiagnosticKind::NestingOverflow, tk);
			return;
		}

		let value = !value.is_zero();
		let was_skipping = self.skipping();
		self.state.if_level += 1;
		self.state.true_test[self.state.if_level] = value;
		if was_skipping {
			self.state.skipping[self.state.if_level] = true;
		} else {
			self.state.skipping[self.state.if_level] = !value;
			if !value {
				self.start_skipping_blocks(&last_expression_token);
			}
		}
	}

	fn handle_elif_directive(&mut self, tk: &mut PPToken, pound_token: &PPToken) {
		if self.state.if_level == 0 {
			warn!("#elif without matching #if");
			self.handle_if_directive(tk);
			return;
		}

		self.lex(tk); // consume `elif`
		if self.state.skipping[self.state.if_level - 1] {
			// Nested inside a skipped block; nothing can turn this on.
			self.state.skipping[self.state.if_level] = true;
		} else if self.state.true_test[self.state.if_level] {
			// A sibling branch already won; start skipping if the
			// preceding branch was the winner.
			if !self.state.skipping[self.state.if_level] {
				self.state.skipping[self.state.if_level] = true;
				self.start_skipping_blocks(pound_token);
			}
		} else {
			let (value, _) = self.eval_expression(tk);
			let start_skipping = value.is_zero();
			self.state.true_test[self.state.if_level] = !start_skipping;
			self.state.skipping[self.state.if_level] = start_skipping;
			if !start_skipping {
				let offset = pound_token.utf16_offset.saturating_sub(1);
				if let Some(client) = self.client.as_mut() {
					client.skipping_stopped(offset);
				}
			}
		}
	}

	fn handle_else_directive(&mut self, tk: &mut PPToken, pound_token: &PPToken) {
		self.lex(tk); // consume `else`

		if self.state.if_level == 0 {
			warn!("#else without matching #if");
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return;
		}

		if self.state.skipping[self.state.if_level - 1] {
			self.state.skipping[self.state.if_level] = true;
			return;
		}

		let was_skipping = self.state.skipping[self.state.if_level];
		let start_skipping = self.state.true_test[self.state.if_level];
		self.state.skipping[self.state.if_level] = start_skipping;

		if was_skipping && !start_skipping {
			let offset = pound_token.utf16_offset.saturating_sub(1);
			if let Some(client) = self.client.as_mut() {
				client.skipping_stopped(offset);
			}
		} else if !was_skipping && start_skipping {
			self.start_skipping_blocks(pound_token);
		}
	}

	fn handle_endif_directive(&mut self, tk: &mut PPToken, pound_token: &PPToken) {
		if self.state.if_level == 0 {
			warn!(file = %self.state.current_file, line = tk.line, "#endif without matching #if");
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
		} else {
			let was_skipping = self.state.skipping[self.state.if_level];
			self.state.skipping[self.state.if_level] = false;
			self.state.true_test[self.state.if_level] = false;
			self.state.if_level -= 1;

			if was_skipping && !self.skipping() {
				let offset = pound_token.utf16_offset.saturating_sub(1);
				if let Some(client) = self.client.as_mut() {
					client.skipping_stopped(offset);
				}
			}

			if self.state.if_level == 0 {
				self.update_guard(IncludeGuardHint::Endif, None);
			}
		}

		self.lex(tk); // consume `endif`
	}

	fn handle_ifdef_directive(&mut self, check_undefined: bool, tk: &mut PPToken) {
		self.lex(tk); // consume `ifdef` / `ifndef`
		if !tk.is_continuation() || !tk.is(Kind::Identifier) {
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return;
		}

		if check_undefined && self.state.if_level == 0 {
			let id = tk.clone();
			self.update_guard(IncludeGuardHint::Ifndef, Some(&id));
		}

		let name = tk.text().to_vec();
		let mut value =
			self.macro_definition_check(&name, tk.byte_offset, tk.utf16_offset, tk.line);
		if check_undefined {
			value = !value;
		}

		let was_skipping = self.skipping();
		if self.state.if_level + 1 < self.limits.max_conditional_depth {
			self.state.if_level += 1;
			self.state.true_test[self.state.if_level] = value;
			self.state.skipping[self.state.if_level] = if was_skipping { true } else { !value };

			if !was_skipping && !value {
				let id = tk.clone();
				self.start_skipping_blocks(&id);
			}
		} else {
			self.diagnose(DiagnosticKind::NestingOverflow, tk);
		}

		self.lex(tk); // consume the identifier
	}

	fn handle_undef_directive(&mut self, tk: &mut PPToken) {
		self.lex(tk); // consume `undef`
		if !tk.is_continuation() || !tk.is(Kind::Identifier) {
			self.diagnose(DiagnosticKind::MalformedDirective, tk);
			return;
		}

		let name = tk.text().to_vec();
		let bytes_offset = tk.byte_offset + self.state.bytes_offset_ref;
		let utf16_offset = tk.utf16_offset + self.state.utf16_offset_ref;

		// Track the use if the name was live.
		if let Some(existing) = self.env.resolve(&name) {
			let existing = existing.clone();
			if let Some(client) = self.client.as_mut() {
				client.macro_reference(bytes_offset, utf16_offset, tk.line, &existing);
			}
		}
		self.synchronize_output_lines(tk, false);

		let sentinel = {
			let sentinel = self.env.remove(&name);
			sentinel.byte_offset = bytes_offset;
			sentinel.utf16_offset = utf16_offset;
			sentinel.clone()
		};
		if let Some(client) = self.client.as_mut() {
			client.macro_added(&sentinel);
		}

		self.lex(tk); // consume the name
	}

	/// Report where the skipped region starts: the first position after
	/// the end of the line holding the failed condition.
	fn start_skipping_blocks(&mut self, tk: &PPToken) {
		if self.client.is_none() {
			return;
		}
		let source = tk.buffer();
		let mut pos = tk.bytes_end() as usize;
		let mut utf16 = tk.utf16_end();
		while pos < source.len() {
			if source[pos] == b'\n' {
				if let Some(client) = self.client.as_mut() {
					client.skipping_started(utf16 + 1);
				}
				return;
			}
			let (len, units) = util::char_width(&source[pos..]);
			pos += len;
			utf16 += units;
		}
	}

	/// Zero-width markers bracket each top-level expansion. The opening
	/// one switches output into the expansion buffer; the closing one
	/// flushes `# expansion begin …` + tokens + `# expansion end` into
	/// the main result.
	fn track_expansion_cycles(&mut self, tk: &mut PPToken) {
		if !self.state.mark_expanded_tokens {
			return;
		}
		while tk.expanded && !tk.has_source() {
			match self.state.expansion_status {
				ExpansionStatus::ReadyForExpansion => {
					self.state.expansion_status = ExpansionStatus::Expanding;
					self.state.expansion_result.clear();
					self.state.expanded_tokens_info.clear();
				}
				ExpansionStatus::Expanding => {
					self.state.expansion_status = ExpansionStatus::JustFinishedExpansion;
					self.maybe_start_output_line();

					// Offset and length of the invocation, then one tag
					// per token: `~N` for N generated tokens, `L:C` for a
					// source-backed one.
					let mut header = format!("# expansion begin {},{}", tk.byte_offset, tk.byte_len);
					let mut generated_count = 0usize;
					for &(line, column) in &self.state.expanded_tokens_info {
						if line != 0 {
							if generated_count != 0 {
								let _ = write!(header, " ~{generated_count}");
								generated_count = 0;
							}
							let _ = write!(header, " {line}:{column}");
						} else {
							generated_count += 1;
						}
					}
					if generated_count != 0 {
						let _ = write!(header, " ~{generated_count}");
					}
					header.push('\n');

					// Status already left Expanding, so this goes to the
					// main result.
					self.current_output_buffer().extend_from_slice(header.as_bytes());
					{
						let state = &mut self.state;
						state.result.extend_from_slice(&state.expansion_result);
						state.expansion_result.clear();
					}
					self.maybe_start_output_line();
					self.current_output_buffer().extend_from_slice(b"# expansion end\n");
				}
				_ => {}
			}

			self.lex(tk);
		}
	}

	fn current_output_buffer(&mut self) -> &mut Vec<u8> {
		if self.state.expansion_status == ExpansionStatus::Expanding {
			&mut self.state.expansion_result
		} else {
			&mut self.state.result
		}
	}

	fn current_output_buffer_ref(&self) -> &[u8] {
		if self.state.expansion_status == ExpansionStatus::Expanding {
			&self.state.expansion_result
		} else {
			&self.state.result
		}
	}

	fn at_start_of_output_line(&self) -> bool {
		let buffer = self.current_output_buffer_ref();
		buffer.is_empty() || buffer.ends_with(b"\n")
	}

	fn maybe_start_output_line(&mut self) {
		let buffer = self.current_output_buffer();
		if buffer.is_empty() {
			return;
		}
		if !buffer.ends_with(b"\n") {
			buffer.push(b'\n');
		}
		// A trailing backslash would splice the upcoming marker onto the
		// previous line; break it with one more newline.
		let mut i = buffer.len().saturating_sub(2);
		while i > 0 && buffer[i] != b'\n' && util::is_space(buffer[i]) {
			i -= 1;
		}
		if buffer.get(i) == Some(&b'\\') {
			buffer.push(b'\n');
		}
	}

	fn generate_output_line_marker(&mut self, lineno: u32) {
		self.maybe_start_output_line();
		let marker = format!("# {lineno} \"{}\"\n", self.env.current_file);
		self.current_output_buffer().extend_from_slice(marker.as_bytes());
	}

	/// Keep the output's line count in step with the input: small gaps
	/// become newlines, larger jumps a line marker (or a lone space when
	/// markers are suppressed).
	fn synchronize_output_lines(&mut self, tk: &PPToken, force_line: bool) {
		let current_line = self.env.current_line;
		if self.state.expansion_status != ExpansionStatus::NotExpanding || (!force_line && current_line == tk.line) {
			self.adjust_for_multiline_token(tk);
			return;
		}

		if force_line || current_line > tk.line || tk.line - current_line >= 9 {
			if self.state.no_lines {
				if !self.state.mark_expanded_tokens {
					self.current_output_buffer().push(b' ');
				}
			} else {
				self.generate_output_line_marker(tk.line);
			}
		} else {
			let gap = (tk.line - current_line) as usize;
			let buffer = self.current_output_buffer();
			buffer.resize(buffer.len() + gap, b'\n');
		}

		self.env.current_line = tk.line;
		self.adjust_for_multiline_token(tk);
	}

	fn adjust_for_multiline_token(&mut self, tk: &PPToken) {
		if tk.kind.is_comment() || tk.is(Kind::StringLiteral) {
			self.env.current_line += util::count_newlines(tk.text());
		}
	}

	/// Reproduce inter-token spacing. Expanded tokens get a single space;
	/// source-backed tokens replay the original gap byte-for-byte, with
	/// anything that is not whitespace turned into spaces.
	fn enforce_spacing(&mut self, tk: &PPToken, force_spacing: bool) {
		if !tk.whitespace && !force_spacing {
			return;
		}
		if tk.expanded && !self.at_start_of_output_line() {
			self.current_output_buffer().push(b' ');
		} else {
			let spacing = compute_distance(tk, force_spacing);
			let buffer = tk.buffer();
			let begin = (tk.byte_offset as usize).min(buffer.len());
			let gap: Vec<u8> = buffer[begin.saturating_sub(spacing)..begin]
				.iter()
				.map(|&b| if util::is_space(b) { b } else { b' ' })
				.collect();
			self.current_output_buffer().extend_from_slice(&gap);
		}
	}
}

/// Distance from the token back to the previous non-space byte, or to the
/// start of the line when `force_till_line` (that is: the column).
fn compute_distance(tk: &PPToken, force_till_line: bool) -> usize {
	let buffer = tk.buffer();
	let begin = (tk.byte_offset as usize).min(buffer.len());
	let mut it = begin;
	while it > 0 {
		let b = buffer[it - 1];
		if b == b'\n' {
			break;
		}
		if !util::is_space(b) && !force_till_line {
			break;
		}
		it -= 1;
	}
	begin - it
}

/// Synthesize a token backed by its own scratch bytes.
fn generate_token(kind: Kind, content: &[u8], lineno: u32, add_quotes: bool) -> PPToken {
	let quoted = kind == Kind::StringLiteral && add_quotes;
	let mut bytes: Vec<u8> = Vec::with_capacity(content.len() + 2);
	if quoted {
		bytes.push(b'"');
	}
	bytes.extend_from_slice(content);
	if quoted {
		bytes.push(b'"');
	}

	let utf16_len = util::utf16_len(&bytes);
	let byte_len = bytes.len() as u32;
	let mut tk = PPToken::with_source(SourceBytes::from(&bytes[..]));
	tk.kind = kind;
	tk.byte_len = byte_len;
	tk.utf16_len = utf16_len;
	tk.line = lineno;
	tk.expanded = true;
	tk.generated = true;
	tk
}

/// Fuse two spellings into one token, re-lexed so `foo ## bar` comes out
/// an identifier and `12 ## 3` a number.
fn generate_concatenated(left: &PPToken, right: &PPToken) -> PPToken {
	let mut text = Vec::with_capacity(left.text().len() + right.text().len());
	text.extend_from_slice(left.text());
	text.extend_from_slice(right.text());
	let kind = {
		let tokens = lexer::tokenize(SourceBytes::from(&text[..]));
		if tokens.len() == 2 { tokens[0].kind } else { Kind::Identifier }
	};
	let mut tk = generate_token(kind, &text, left.line, false);
	tk.whitespace = left.whitespace;
	tk
}

fn escape_for_string_literal(bytes: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(bytes.len());
	for &b in bytes {
		if b == b'\\' || b == b'"' {
			out.push(b'\\');
		}
		out.push(b);
	}
	out
}

/// `//x` becomes `/*x*/`, inner `*/` defused to `*|` (GCC's approach).
fn line_comment_to_block(text: &[u8]) -> Vec<u8> {
	let inner = text.get(2..).unwrap_or(&[]);
	let mut out = Vec::with_capacity(inner.len() + 4);
	out.extend_from_slice(b"/*");
	let mut i = 0;
	while i < inner.len() {
		if inner[i] == b'*' && inner.get(i + 1) == Some(&b'/') {
			out.extend_from_slice(b"*|");
			i += 2;
		} else {
			out.push(inner[i]);
			i += 1;
		}
	}
	out.extend_from_slice(b"*/");
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn preprocess(source: &str) -> String {
		let mut env = Environment::new();
		let mut pp = Preprocessor::new(None, &mut env);
		let out = pp.run_opts("test.c", source.as_bytes(), true, false);
		String::from_utf8(out).unwrap()
	}

	fn tokens_of(out: &str) -> Vec<&str> {
		out.split_whitespace().collect()
	}

	#[test]
	fn plain_text_passes_through() {
		let out = preprocess("int x;\n");
		assert_eq!(tokens_of(&out), vec!["int", "x", ";"]);
	}

	#[test]
	fn object_macro_expands() {
		let out = preprocess("#define X 1\nint a = X;\n");
		assert_eq!(tokens_of(&out), vec!["int", "a", "=", "1", ";"]);
	}

	#[test]
	fn function_macro_expands() {
		let out = preprocess("#define SQ(x) ((x)*(x))\nSQ(1+2)\n");
		assert_eq!(tokens_of(&out).join(""), "((1+2)*(1+2))");
	}

	#[test]
	fn nested_call_in_argument() {
		let out = preprocess("#define F(x) x\nF(F(1))\n");
		assert_eq!(tokens_of(&out), vec!["1"]);
	}

	#[test]
	fn mutual_recursion_blocks() {
		let out = preprocess("#define A B\n#define B A\nA\n");
		assert_eq!(tokens_of(&out), vec!["A"]);
	}

	#[test]
	fn self_reference_blocks() {
		let out = preprocess("#define FOO FOO\nFOO\n");
		assert_eq!(tokens_of(&out), vec!["FOO"]);
	}

	#[test]
	fn stringize_normalizes_whitespace() {
		let out = preprocess("#define S(x) #x\nS(a b  c)\n");
		assert_eq!(tokens_of(&out), vec!["\"a b c\""]);
	}

	#[test]
	fn stringize_escapes() {
		let out = preprocess("#define S(x) #x\nS(\"q\")\n");
		assert_eq!(tokens_of(&out), vec!["\"\\\"q\\\"\""]);
	}

	#[test]
	fn token_paste() {
		let out = preprocess("#define C(a,b) a##b\nC(foo,bar)\n");
		assert_eq!(tokens_of(&out), vec!["foobar"]);
	}

	#[test]
	fn variadic_args() {
		let out = preprocess("#define L(...) __VA_ARGS__\nL(1,2,3)\n");
		assert_eq!(tokens_of(&out).join(""), "1,2,3");
	}

	#[test]
	fn named_variadic_tail() {
		let out = preprocess("#define F(a, ...) a + __VA_ARGS__\nF(1, 2, 3)\n");
		assert_eq!(out.trim(), "1 + 2, 3");
	}

	#[test]
	fn empty_function_macro_vanishes() {
		let out = preprocess("#define F()\nF()\n");
		assert_eq!(tokens_of(&out), Vec::<&str>::new());
	}

	#[test]
	fn wrong_arity_left_alone() {
		let out = preprocess("#define F(a,b) a+b\nF(1)\n");
		assert_eq!(tokens_of(&out).join(""), "F(1)");
	}

	#[test]
	fn no_parens_left_alone() {
		let out = preprocess("#define F(a) a\nF;\n");
		assert_eq!(tokens_of(&out).join(""), "F;");
	}

	#[test]
	fn conditional_if_else() {
		let out = preprocess("#define X 1\n#if X\nyes\n#else\nno\n#endif\n");
		assert_eq!(tokens_of(&out), vec!["yes"]);
	}

	#[test]
	fn conditional_elif_chain() {
		let out = preprocess("#define V 2\n#if V == 1\na\n#elif V == 2\nb\n#elif V == 3\nc\n#else\nd\n#endif\n");
		assert_eq!(tokens_of(&out), vec!["b"]);
	}

	#[test]
	fn ifdef_and_ifndef() {
		let out = preprocess("#define X\n#ifdef X\nhas\n#endif\n#ifndef X\nnot\n#endif\n");
		assert_eq!(tokens_of(&out), vec!["has"]);
	}

	#[test]
	fn defined_operator_in_condition() {
		let out = preprocess("#define X\n#if defined(X)\na\n#endif\n#if defined X\nb\n#endif\n#if !defined(Y)\nc\n#endif\n");
		assert_eq!(tokens_of(&out), vec!["a", "b", "c"]);
	}

	#[test]
	fn undef_stops_expansion() {
		let out = preprocess("#define X 1\n#undef X\nX\n");
		assert_eq!(tokens_of(&out), vec!["X"]);
	}

	#[test]
	fn nested_conditions_skip_inner() {
		let out = preprocess("#if 0\n#if 1\na\n#endif\nb\n#endif\nc\n");
		assert_eq!(tokens_of(&out), vec!["c"]);
	}

	#[test]
	fn constant_expression_conditions() {
		let out = preprocess("#if 1 + 2 * 3 == 7\nyes\n#endif\n#if 1 << 2 | 1\nfive\n#endif\n");
		assert_eq!(tokens_of(&out), vec!["yes", "five"]);
	}

	#[test]
	fn condition_expands_macros() {
		let out = preprocess("#define N 4\n#if N > 3\nbig\n#endif\n");
		assert_eq!(tokens_of(&out), vec!["big"]);
	}

	#[test]
	fn line_builtin() {
		let out = preprocess("__LINE__\n__LINE__\n");
		assert_eq!(tokens_of(&out), vec!["1", "2"]);
	}

	#[test]
	fn file_builtin() {
		let out = preprocess("__FILE__\n");
		assert_eq!(tokens_of(&out), vec!["\"test.c\""]);
	}

	#[test]
	fn spliced_define_body() {
		let out = preprocess("#define X a \\\n b\nX\n");
		assert_eq!(tokens_of(&out), vec!["a", "b"]);
	}

	#[test]
	fn output_ends_with_newline() {
		for source in ["x", "x\n", "#define A 1\n", ""] {
			let out = preprocess(source);
			assert!(out.ends_with('\n'), "{source:?} produced {out:?}");
		}
	}

	#[test]
	fn line_markers_emitted_when_enabled() {
		let mut env = Environment::new();
		let mut pp = Preprocessor::new(None, &mut env);
		let out = pp.run_opts("test.c", b"int x;\n", false, true);
		let out = String::from_utf8(out).unwrap();
		assert!(out.starts_with("# 1 \"test.c\"\n"));
	}

	#[test]
	fn reserved_identifier_is_not_expanded() {
		let mut env = Environment::new();
		let mut pp = Preprocessor::new(None, &mut env);
		pp.set_reserved_identifier_predicate(Some(|name| name == b"SIGNAL"));
		let out = pp.run_opts("t.c", b"#define SIGNAL(x) x\nSIGNAL(a)\n", true, false);
		assert_eq!(String::from_utf8(out).unwrap().split_whitespace().collect::<Vec<_>>().join(""), "SIGNAL(a)");
	}

	#[test]
	fn function_like_expansion_can_be_disabled() {
		let mut env = Environment::new();
		let mut pp = Preprocessor::new(None, &mut env);
		pp.set_expand_function_like_macros(false);
		let out = pp.run_opts("t.c", b"#define OBJ 1\n#define F(x) x\nOBJ F(2)\n", true, false);
		let out = String::from_utf8(out).unwrap();
		assert_eq!(out.split_whitespace().collect::<Vec<_>>().join(""), "1F(2)");
	}

	#[test]
	fn include_requests_reach_the_client() {
		struct Includes(Vec<(String, IncludeType)>);
		impl Client for Includes {
			fn source_needed(
				&mut self, _env: &mut Environment, _line: u32, path: &str, mode: IncludeType,
				_initial_includes: &[String],
			) {
				self.0.push((path.to_owned(), mode));
			}
		}
		let mut client = Includes(Vec::new());
		let mut env = Environment::new();
		let mut pp = Preprocessor::new(Some(&mut client), &mut env);
		pp.run_opts(
			"t.c",
			b"#include \"a.h\"\n#include <b.h>\n#include_next \"c.h\"\n#define H \"d.h\"\n#include H\n",
			true,
			false,
		);
		assert_eq!(
			client.0,
			vec![
				("a.h".to_owned(), IncludeType::Local),
				("b.h".to_owned(), IncludeType::Global),
				("c.h".to_owned(), IncludeType::Next),
				("d.h".to_owned(), IncludeType::Local),
			]
		);
	}

	#[test]
	fn endif_without_if_recovers() {
		let out = preprocess("#endif\nx\n");
		assert_eq!(tokens_of(&out), vec!["x"]);
	}

	#[test]
	fn deep_nesting_is_clamped() {
		let mut source = String::new();
		for _ in 0..600 {
			source.push_str("#if 1\n");
		}
		source.push_str("mid\n");
		for _ in 0..600 {
			source.push_str("#endif\n");
		}
		let out = preprocess(&source);
		assert_eq!(tokens_of(&out), vec!["mid"]);
	}
}
