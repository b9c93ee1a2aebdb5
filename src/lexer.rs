//! Reference lexer for the preprocessor token contract.
//!
//! Scans one token on demand from a shared byte buffer, maintaining the
//! line counter, the parallel UTF-16 offset, and the layout flags the
//! driver depends on: `newline` (first token on its physical line),
//! `whitespace` (horizontal space or a swallowed comment before the
//! token), `joined` (the token follows a backslash-newline splice).
//!
//! The driver uses this lexer for the primary source, for re-tokenising
//! expanded `#if` conditions, and for fusing `##` pastes. Hosts with their
//! own lexers only need to produce equivalent [`PPToken`] streams.

use crate::token::{Kind, PPToken, SourceBytes};
use crate::util;

pub struct Lexer {
	src: SourceBytes,
	pos: usize,
	utf16_pos: u32,
	line: u32,
	/// The next token is the first on its physical line.
	at_line_start: bool,
	/// The next token follows a backslash-newline splice.
	after_splice: bool,
	scan_angle_strings: bool,
	scan_comments: bool,
}

impl Lexer {
	pub fn new(src: SourceBytes) -> Self {
		Self {
			src,
			pos: 0,
			utf16_pos: 0,
			line: 1,
			at_line_start: true,
			after_splice: false,
			scan_angle_strings: false,
			scan_comments: false,
		}
	}

	/// Enable recognition of `<header>` tokens; only ever switched on for
	/// the one token following `#include`.
	pub fn set_scan_angle_string_literals(&mut self, on: bool) {
		self.scan_angle_strings = on;
	}

	/// When off, comments are swallowed as whitespace.
	pub fn set_scan_comment_tokens(&mut self, on: bool) {
		self.scan_comments = on;
	}

	fn peek(&self, ahead: usize) -> u8 {
		self.src.get(self.pos + ahead).copied().unwrap_or(0)
	}

	fn cur(&self) -> u8 {
		self.peek(0)
	}

	fn at_end(&self) -> bool {
		self.pos >= self.src.len()
	}

	/// Advance over one character, keeping the UTF-16 counter in sync.
	fn bump(&mut self) {
		if self.at_end() {
			return;
		}
		let b = self.cur();
		if b == b'\n' {
			self.line += 1;
			self.pos += 1;
			self.utf16_pos += 1;
			return;
		}
		let (len, units) = util::char_width(&self.src[self.pos..]);
		self.pos += len;
		self.utf16_pos += units;
	}

	/// Skip whitespace, splices and (when not scanned as tokens) comments,
	/// folding what was crossed into the given flags.
	fn skip_trivia(&mut self, whitespace: &mut bool) {
		loop {
			let b = self.cur();
			if util::is_horizontal_space(b) {
				*whitespace = true;
				self.bump();
			} else if b == b'\r' {
				self.bump();
			} else if b == b'\n' {
				self.at_line_start = true;
				self.after_splice = false;
				*whitespace = false;
				self.bump();
			} else if b == b'\\' && (self.peek(1) == b'\n' || (self.peek(1) == b'\r' && self.peek(2) == b'\n')) {
				// Line splice: the next token continues the logical line.
				self.bump();
				if self.cur() == b'\r' {
					self.bump();
				}
				self.bump();
				self.at_line_start = true;
				self.after_splice = true;
			} else if !self.scan_comments && b == b'/' && self.peek(1) == b'*' {
				self.skip_block_comment();
				*whitespace = true;
			} else if !self.scan_comments && b == b'/' && self.peek(1) == b'/' {
				while !self.at_end() && self.cur() != b'\n' {
					self.bump();
				}
				*whitespace = true;
			} else {
				return;
			}
		}
	}

	fn skip_block_comment(&mut self) {
		self.bump();
		self.bump();
		while !self.at_end() {
			if self.cur() == b'*' && self.peek(1) == b'/' {
				self.bump();
				self.bump();
				return;
			}
			self.bump();
		}
	}

	/// Produce the next token. At end of input, returns EOF tokens forever.
	pub fn scan(&mut self) -> PPToken {
		let mut tk = PPToken::with_source(self.src.clone());
		let mut whitespace = false;
		self.skip_trivia(&mut whitespace);

		tk.byte_offset = self.pos as u32;
		tk.utf16_offset = self.utf16_pos;
		tk.line = self.line;
		tk.newline = self.at_line_start;
		tk.joined = self.after_splice;
		tk.whitespace = whitespace;

		if self.at_end() {
			tk.kind = Kind::Eof;
			tk.newline = true;
			return tk;
		}
		self.at_line_start = false;
		self.after_splice = false;

		let b = self.cur();
		tk.kind = if util::is_ident_start(b) {
			self.bump();
			while util::is_ident_cont(self.cur()) {
				self.bump();
			}
			Kind::Identifier
		} else if b.is_ascii_digit() || (b == b'.' && self.peek(1).is_ascii_digit()) {
			self.scan_number()
		} else if b == b'"' {
			self.scan_quoted(b'"');
			Kind::StringLiteral
		} else if b == b'\'' {
			self.scan_quoted(b'\'');
			Kind::CharLiteral
		} else if b == b'<' && self.scan_angle_strings {
			self.bump();
			while !self.at_end() && self.cur() != b'>' && self.cur() != b'\n' {
				self.bump();
			}
			if self.cur() == b'>' {
				self.bump();
			}
			Kind::AngleStringLiteral
		} else if b == b'/' && self.peek(1) == b'*' {
			self.skip_block_comment();
			Kind::Comment
		} else if b == b'/' && self.peek(1) == b'/' {
			while !self.at_end() && self.cur() != b'\n' {
				self.bump();
			}
			Kind::LineComment
		} else {
			self.scan_punctuator()
		};

		tk.byte_len = self.pos as u32 - tk.byte_offset;
		tk.utf16_len = self.utf16_pos - tk.utf16_offset;
		tk
	}

	/// pp-number: digits plus identifier characters, dots, and signed
	/// exponents. Suffix validity is not the preprocessor's business.
	fn scan_number(&mut self) -> Kind {
		self.bump();
		loop {
			let b = self.cur();
			if matches!(b, b'e' | b'E' | b'p' | b'P') && matches!(self.peek(1), b'+' | b'-') {
				self.bump();
				self.bump();
			} else if util::is_ident_cont(b) || b == b'.' || b == b'\'' {
				self.bump();
			} else {
				return Kind::Number;
			}
		}
	}

	/// String or character literal with backslash escapes; an unterminated
	/// literal ends at the newline so the driver can resynchronise.
	fn scan_quoted(&mut self, quote: u8) {
		self.bump();
		while !self.at_end() {
			let b = self.cur();
			if b == b'\\' {
				self.bump();
				self.bump();
			} else if b == quote {
				self.bump();
				return;
			} else if b == b'\n' {
				return;
			} else {
				self.bump();
			}
		}
	}

	fn scan_punctuator(&mut self) -> Kind {
		let b = self.cur();
		let b1 = self.peek(1);
		let b2 = self.peek(2);
		// Longest match first so `<<=` never splits into `<` `<=`.
		let (kind, len) = match (b, b1, b2) {
			(b'<', b'<', b'=') | (b'>', b'>', b'=') => (Kind::Other, 3),
			(b'.', b'.', b'.') => (Kind::Ellipsis, 3),
			(b'#', b'#', _) => (Kind::PoundPound, 2),
			(b'&', b'&', _) => (Kind::AmpAmp, 2),
			(b'|', b'|', _) => (Kind::PipePipe, 2),
			(b'<', b'<', _) => (Kind::LessLess, 2),
			(b'>', b'>', _) => (Kind::GreaterGreater, 2),
			(b'<', b'=', _) => (Kind::LessEqual, 2),
			(b'>', b'=', _) => (Kind::GreaterEqual, 2),
			(b'=', b'=', _) => (Kind::EqualEqual, 2),
			(b'!', b'=', _) => (Kind::ExclaimEqual, 2),
			(b'+', b'+', _)
			| (b'-', b'-', _)
			| (b'-', b'>', _)
			| (b':', b':', _)
			| (b'+', b'=', _)
			| (b'-', b'=', _)
			| (b'*', b'=', _)
			| (b'/', b'=', _)
			| (b'%', b'=', _)
			| (b'&', b'=', _)
			| (b'|', b'=', _)
			| (b'^', b'=', _) => (Kind::Other, 2),
			(b'#', ..) => (Kind::Pound, 1),
			(b'(', ..) => (Kind::LParen, 1),
			(b')', ..) => (Kind::RParen, 1),
			(b',', ..) => (Kind::Comma, 1),
			(b'+', ..) => (Kind::Plus, 1),
			(b'-', ..) => (Kind::Minus, 1),
			(b'*', ..) => (Kind::Star, 1),
			(b'/', ..) => (Kind::Slash, 1),
			(b'%', ..) => (Kind::Percent, 1),
			(b'&', ..) => (Kind::Amp, 1),
			(b'|', ..) => (Kind::Pipe, 1),
			(b'^', ..) => (Kind::Caret, 1),
			(b'~', ..) => (Kind::Tilde, 1),
			(b'!', ..) => (Kind::Exclaim, 1),
			(b'<', ..) => (Kind::Less, 1),
			(b'>', ..) => (Kind::Greater, 1),
			(b'?', ..) => (Kind::Question, 1),
			(b':', ..) => (Kind::Colon, 1),
			// Lone `=` and everything else the preprocessor has no
			// opinion about.
			_ => (Kind::Other, 1),
		};
		for _ in 0..len {
			self.bump();
		}
		kind
	}
}

/// Tokenize a whole buffer in preprocessor mode, EOF token included. Used
/// for `#if` conditions after expansion and by tests.
pub fn tokenize(src: SourceBytes) -> Vec<PPToken> {
	let mut lexer = Lexer::new(src);
	let mut out = Vec::new();
	loop {
		let tk = lexer.scan();
		let done = tk.is(Kind::Eof);
		out.push(tk);
		if done {
			return out;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lex(text: &str) -> Vec<PPToken> {
		tokenize(SourceBytes::from(text.as_bytes()))
	}

	fn kinds(text: &str) -> Vec<Kind> {
		lex(text).into_iter().map(|t| t.kind).collect()
	}

	#[test]
	fn identifiers_and_numbers() {
		assert_eq!(kinds("foo 0x1f 1.5e+3"), vec![Kind::Identifier, Kind::Number, Kind::Number, Kind::Eof]);
	}

	#[test]
	fn punctuator_max_munch() {
		assert_eq!(kinds("<<="), vec![Kind::Other, Kind::Eof]);
		assert_eq!(kinds("<< ="), vec![Kind::LessLess, Kind::Other, Kind::Eof]);
		assert_eq!(kinds("##"), vec![Kind::PoundPound, Kind::Eof]);
		assert_eq!(kinds("# #"), vec![Kind::Pound, Kind::Pound, Kind::Eof]);
		assert_eq!(kinds("..."), vec![Kind::Ellipsis, Kind::Eof]);
	}

	#[test]
	fn newline_and_whitespace_flags() {
		let toks = lex("a b\nc");
		assert!(toks[0].newline && !toks[0].whitespace);
		assert!(!toks[1].newline && toks[1].whitespace);
		assert!(toks[2].newline && !toks[2].joined);
	}

	#[test]
	fn spliced_line_sets_joined() {
		let toks = lex("#define X \\\n 1\n");
		let one = toks.iter().find(|t| t.text() == b"1").unwrap();
		assert!(one.newline && one.joined);
		assert!(one.is_continuation());
	}

	#[test]
	fn comments_are_whitespace_unless_scanned() {
		let toks = lex("a/*x*/b");
		assert_eq!(toks[1].text(), b"b");
		assert!(toks[1].whitespace);

		let mut lexer = Lexer::new(SourceBytes::from(&b"a/*x*/b"[..]));
		lexer.set_scan_comment_tokens(true);
		let a = lexer.scan();
		let c = lexer.scan();
		let b = lexer.scan();
		assert_eq!(a.kind, Kind::Identifier);
		assert_eq!(c.kind, Kind::Comment);
		assert_eq!(c.text(), b"/*x*/");
		assert_eq!(b.text(), b"b");
	}

	#[test]
	fn angle_strings_only_on_request() {
		assert_eq!(kinds("<x>"), vec![Kind::Less, Kind::Identifier, Kind::Greater, Kind::Eof]);
		let mut lexer = Lexer::new(SourceBytes::from(&b"<stdio.h>"[..]));
		lexer.set_scan_angle_string_literals(true);
		let tk = lexer.scan();
		assert_eq!(tk.kind, Kind::AngleStringLiteral);
		assert_eq!(tk.text(), b"<stdio.h>");
	}

	#[test]
	fn string_with_escapes() {
		let toks = lex(r#""a\"b" x"#);
		assert_eq!(toks[0].kind, Kind::StringLiteral);
		assert_eq!(toks[0].text(), br#""a\"b""#);
	}

	#[test]
	fn utf16_offsets_track_multibyte_content() {
		let toks = lex("\"日本\" x");
		assert_eq!(toks[0].byte_len, 8);
		assert_eq!(toks[0].utf16_len, 4);
		assert_eq!(toks[1].utf16_offset, 5);
	}

	#[test]
	fn lines_count_through_block_comments() {
		let toks = lex("a /* x\ny */ b");
		assert_eq!(toks[0].line, 1);
		assert_eq!(toks[1].line, 2);
	}

	#[test]
	fn eof_is_sticky() {
		let mut lexer = Lexer::new(SourceBytes::from(&b"x"[..]));
		lexer.scan();
		assert_eq!(lexer.scan().kind, Kind::Eof);
		assert_eq!(lexer.scan().kind, Kind::Eof);
	}
}
