//! The macro record: everything the engine and host tooling need to know
//! about one `#define` (or one `#undef` sentinel).

use crate::token::PPToken;
use itertools::Itertools;
use smartstring::alias::String;

#[derive(Clone, Debug, Default)]
pub struct Macro {
	/// Never empty for a bound macro.
	pub name: String,
	/// Ordered formal parameters; empty for object-like macros. For a
	/// variadic macro the last formal is the variadic one (an explicit
	/// name, or `__VA_ARGS__`).
	pub formals: Vec<String>,
	/// Replacement-list tokens, already flagged `expanded` (and
	/// `generated` for object-like bodies).
	pub body: Vec<PPToken>,
	/// Verbatim body text as written, for display.
	pub definition_text: Vec<u8>,
	pub file_path: std::string::String,
	pub file_revision: u32,
	pub line: u32,
	pub byte_offset: u32,
	pub utf16_offset: u32,
	/// Byte length of the whole `#define`, name through body end.
	pub length: u32,
	/// A shadowing sentinel left behind by `#undef`; visible to tooling,
	/// never resolvable.
	pub hidden: bool,
	pub function_like: bool,
	pub variadic: bool,
}

impl Macro {
	/// `NAME` or `NAME(a, b, ...)`.
	pub fn decorated_name(&self) -> std::string::String {
		let mut out = std::string::String::from(self.name.as_str());
		if self.function_like {
			out.push('(');
			out.push_str(&self.formals.iter().join(", "));
			if self.variadic && !self.formals.iter().any(|f| f.as_str() == "__VA_ARGS__") {
				out.push_str("...");
			}
			out.push(')');
		}
		out
	}

	/// Single-line display form: `#define N(a, b) body` (newlines in the
	/// body collapsed to spaces), or `#undef N` for a hidden sentinel.
	pub fn to_display_string(&self) -> std::string::String {
		let text = self.to_display_string_with_line_breaks();
		text.split(['\n', '\r']).filter(|s| !s.is_empty()).join(" ")
	}

	/// Display form preserving the body's own line breaks.
	pub fn to_display_string_with_line_breaks(&self) -> std::string::String {
		if self.hidden {
			return format!("#undef {}", self.name);
		}
		let mut out = format!("#define {}", self.decorated_name());
		if !self.definition_text.is_empty() {
			out.push(' ');
			out.push_str(&std::string::String::from_utf8_lossy(&self.definition_text));
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn object_like_display() {
		let mac = Macro {
			name: "VERSION".into(),
			definition_text: b"0x0705".to_vec(),
			..Macro::default()
		};
		assert_eq!(mac.to_display_string(), "#define VERSION 0x0705");
	}

	#[test]
	fn function_like_display() {
		let mac = Macro {
			name: "MIN".into(),
			formals: vec!["a".into(), "b".into()],
			function_like: true,
			definition_text: b"((a) < (b) ? (a) : (b))".to_vec(),
			..Macro::default()
		};
		assert_eq!(mac.decorated_name(), "MIN(a, b)");
		assert_eq!(mac.to_display_string(), "#define MIN(a, b) ((a) < (b) ? (a) : (b))");
	}

	#[test]
	fn variadic_display() {
		let mac = Macro {
			name: "LOG".into(),
			formals: vec!["fmt".into(), "args".into()],
			function_like: true,
			variadic: true,
			..Macro::default()
		};
		assert_eq!(mac.decorated_name(), "LOG(fmt, args...)");

		let implicit = Macro {
			name: "LOG".into(),
			formals: vec!["__VA_ARGS__".into()],
			function_like: true,
			variadic: true,
			..Macro::default()
		};
		assert_eq!(implicit.decorated_name(), "LOG(__VA_ARGS__)");
	}

	#[test]
	fn hidden_display() {
		let mac = Macro { name: "GONE".into(), hidden: true, ..Macro::default() };
		assert_eq!(mac.to_display_string(), "#undef GONE");
	}

	#[test]
	fn multiline_body_collapses() {
		let mac = Macro {
			name: "TWO".into(),
			definition_text: b"a \\\nb".to_vec(),
			..Macro::default()
		};
		assert_eq!(mac.to_display_string(), "#define TWO a \\ b");
	}
}
