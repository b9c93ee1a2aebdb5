//! Preprocessing tokens. A token is a kind plus a byte range into a shared
//! immutable source buffer, with a parallel UTF-16 range so editors can map
//! offsets without re-decoding, and a handful of layout flags the driver
//! relies on (start-of-line, leading whitespace, line splices, expansion
//! provenance).

use std::sync::Arc;

/// Shared immutable source bytes. Cloning is a refcount bump; tokens from
/// the same buffer all point at the same allocation.
pub type SourceBytes = Arc<[u8]>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Kind {
	/// End of input. Also the kind of a freshly constructed token.
	#[default]
	Eof,
	/// Zero-width bookkeeping token bracketing an expansion; never written
	/// to the output.
	Marker,
	Identifier,
	Number,
	StringLiteral,
	AngleStringLiteral,
	CharLiteral,
	/// `/* ... */`
	Comment,
	/// `// ...`
	LineComment,
	Pound,
	PoundPound,
	LParen,
	RParen,
	Comma,
	Ellipsis,
	Plus,
	Minus,
	Star,
	Slash,
	Percent,
	Amp,
	AmpAmp,
	Pipe,
	PipePipe,
	Caret,
	Tilde,
	Exclaim,
	Less,
	LessEqual,
	LessLess,
	Greater,
	GreaterEqual,
	GreaterGreater,
	EqualEqual,
	ExclaimEqual,
	Question,
	Colon,
	/// Any other punctuator; the preprocessor only ever copies these
	/// through.
	Other,
}

impl Kind {
	pub const fn is_comment(self) -> bool {
		matches!(self, Self::Comment | Self::LineComment)
	}
}

#[derive(Clone, Debug, Default)]
pub struct PPToken {
	pub kind: Kind,
	src: Option<SourceBytes>,
	pub byte_offset: u32,
	pub byte_len: u32,
	pub utf16_offset: u32,
	pub utf16_len: u32,
	pub line: u32,
	/// First token on its physical line.
	pub newline: bool,
	/// Horizontal whitespace (or a swallowed comment) precedes it.
	pub whitespace: bool,
	/// Follows a backslash-newline splice; logically continues the
	/// previous line.
	pub joined: bool,
	/// Produced by macro expansion.
	pub expanded: bool,
	/// Synthesized (stringizing, pasting, built-ins); its bytes live in
	/// driver-owned scratch storage, not the original source.
	pub generated: bool,
}

impl PPToken {
	pub fn with_source(src: SourceBytes) -> Self {
		Self { src: Some(src), ..Self::default() }
	}

	/// Zero-width expansion marker carrying the invocation's byte range.
	pub fn marker(byte_offset: u32, byte_len: u32, line: u32) -> Self {
		Self { kind: Kind::Marker, byte_offset, byte_len, line, expanded: true, ..Self::default() }
	}

	pub fn set_source(&mut self, src: SourceBytes) {
		self.src = Some(src);
	}

	pub fn has_source(&self) -> bool {
		self.src.is_some()
	}

	/// The whole backing buffer, for spacing look-back.
	pub fn buffer(&self) -> &[u8] {
		self.src.as_deref().unwrap_or(&[])
	}

	/// The token's spelling. Empty for markers and EOF.
	pub fn text(&self) -> &[u8] {
		match &self.src {
			Some(src) => {
				let start = self.byte_offset as usize;
				let end = (start + self.byte_len as usize).min(src.len());
				src.get(start.min(src.len())..end).unwrap_or(&[])
			}
			None => &[],
		}
	}

	pub fn is(&self, kind: Kind) -> bool {
		self.kind == kind
	}

	pub const fn bytes_end(&self) -> u32 {
		self.byte_offset + self.byte_len
	}

	pub const fn utf16_end(&self) -> u32 {
		self.utf16_offset + self.utf16_len
	}

	/// A token still belongs to the current logical line unless it opens a
	/// fresh one: EOF and unspliced line starts end a directive.
	pub const fn is_continuation(&self) -> bool {
		!matches!(self.kind, Kind::Eof) && (!self.newline || self.joined)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn src(text: &str) -> SourceBytes {
		SourceBytes::from(text.as_bytes())
	}

	#[test]
	fn text_slices_the_shared_buffer() {
		let mut tk = PPToken::with_source(src("int foo;"));
		tk.kind = Kind::Identifier;
		tk.byte_offset = 4;
		tk.byte_len = 3;
		assert_eq!(tk.text(), b"foo");
		let copy = tk.clone();
		assert_eq!(copy.text(), b"foo");
	}

	#[test]
	fn marker_has_no_spelling() {
		let tk = PPToken::marker(8, 3, 2);
		assert!(!tk.has_source());
		assert!(tk.expanded);
		assert_eq!(tk.text(), b"");
	}

	#[test]
	fn continuation_rules() {
		let mut tk = PPToken::with_source(src("x"));
		tk.kind = Kind::Identifier;
		assert!(tk.is_continuation());
		tk.newline = true;
		assert!(!tk.is_continuation());
		tk.joined = true;
		assert!(tk.is_continuation());
		tk.kind = Kind::Eof;
		assert!(!tk.is_continuation());
	}

	#[test]
	fn out_of_range_slice_is_empty() {
		let mut tk = PPToken::with_source(src("ab"));
		tk.byte_offset = 5;
		tk.byte_len = 2;
		assert_eq!(tk.text(), b"");
	}
}
