//! Constant-expression evaluation for `#if` / `#elif`.
//!
//! Runs over an already macro-expanded token range. Values are 64-bit,
//! signed unless an unsigned operand upgrades the expression, mirroring
//! the C arithmetic conversions at `long` width. Division and modulo by
//! zero quietly produce zero; there is nothing sensible to throw at from
//! inside a conditional.

use crate::client::Client;
use crate::environment::Environment;
use crate::token::{Kind, PPToken};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
	Long(i64),
	ULong(u64),
}

impl Default for Value {
	fn default() -> Self {
		Self::Long(0)
	}
}

/// Generates the arithmetic ops: unsigned operands are contagious, the
/// rest is wrapping two's-complement at width 64.
macro_rules! value_bin_op {
	($name:ident, $signed:expr, $unsigned:expr) => {
		pub fn $name(self, other: Self) -> Self {
			if self.is_unsigned() || other.is_unsigned() {
				Self::ULong($unsigned(self.as_u64(), other.as_u64()))
			} else {
				Self::Long($signed(self.as_i64(), other.as_i64()))
			}
		}
	};
}

/// Comparisons yield 0/1 in the common type, like the C operators they
/// mirror.
macro_rules! value_cmp_op {
	($name:ident, $op:tt) => {
		pub fn $name(self, other: Self) -> Self {
			if self.is_unsigned() || other.is_unsigned() {
				Self::ULong((self.as_u64() $op other.as_u64()) as u64)
			} else {
				Self::Long((self.as_i64() $op other.as_i64()) as i64)
			}
		}
	};
}

impl Value {
	pub const fn is_unsigned(self) -> bool {
		matches!(self, Self::ULong(_))
	}

	pub const fn is_zero(self) -> bool {
		match self {
			Self::Long(v) => v == 0,
			Self::ULong(v) => v == 0,
		}
	}

	pub const fn as_i64(self) -> i64 {
		match self {
			Self::Long(v) => v,
			Self::ULong(v) => v as i64,
		}
	}

	pub const fn as_u64(self) -> u64 {
		match self {
			Self::Long(v) => v as u64,
			Self::ULong(v) => v,
		}
	}

	value_bin_op!(add, |a: i64, b: i64| a.wrapping_add(b), |a: u64, b: u64| a.wrapping_add(b));
	value_bin_op!(sub, |a: i64, b: i64| a.wrapping_sub(b), |a: u64, b: u64| a.wrapping_sub(b));
	value_bin_op!(mul, |a: i64, b: i64| a.wrapping_mul(b), |a: u64, b: u64| a.wrapping_mul(b));
	value_bin_op!(bit_and, |a: i64, b: i64| a & b, |a: u64, b: u64| a & b);
	value_bin_op!(bit_or, |a: i64, b: i64| a | b, |a: u64, b: u64| a | b);
	value_bin_op!(bit_xor, |a: i64, b: i64| a ^ b, |a: u64, b: u64| a ^ b);
	value_bin_op!(shl, |a: i64, b: i64| a.wrapping_shl(b as u32), |a: u64, b: u64| a.wrapping_shl(b as u32));
	value_bin_op!(shr, |a: i64, b: i64| a.wrapping_shr(b as u32), |a: u64, b: u64| a.wrapping_shr(b as u32));
	value_cmp_op!(less, <);
	value_cmp_op!(greater, >);
	value_cmp_op!(less_equal, <=);
	value_cmp_op!(greater_equal, >=);
	value_cmp_op!(equal, ==);
	value_cmp_op!(not_equal, !=);

	pub fn div(self, other: Self) -> Self {
		if other.is_zero() {
			return Self::default();
		}
		if self.is_unsigned() || other.is_unsigned() {
			Self::ULong(self.as_u64() / other.as_u64())
		} else {
			Self::Long(self.as_i64().wrapping_div(other.as_i64()))
		}
	}

	pub fn rem(self, other: Self) -> Self {
		if other.is_zero() {
			return Self::default();
		}
		if self.is_unsigned() || other.is_unsigned() {
			Self::ULong(self.as_u64() % other.as_u64())
		} else {
			Self::Long(self.as_i64().wrapping_rem(other.as_i64()))
		}
	}

	pub fn logical_and(self, other: Self) -> Self {
		Self::Long(i64::from(!self.is_zero() && !other.is_zero()))
	}

	pub fn logical_or(self, other: Self) -> Self {
		Self::Long(i64::from(!self.is_zero() || !other.is_zero()))
	}
}

/// Strip `u`/`l` suffixes, auto-detect the base, convert. A `u` suffix (or
/// a value only representable unsigned) upgrades to unsigned.
fn parse_integer(text: &[u8]) -> Value {
	let mut end = text.len();
	let mut unsigned = false;
	while end > 0 && matches!(text[end - 1], b'u' | b'U' | b'l' | b'L') {
		if matches!(text[end - 1], b'u' | b'U') {
			unsigned = true;
		}
		end -= 1;
	}
	let digits = &text[..end];
	let (digits, radix) = if digits.len() > 2 && (digits.starts_with(b"0x") || digits.starts_with(b"0X")) {
		(&digits[2..], 16)
	} else if digits.len() > 1 && digits[0] == b'0' {
		(&digits[1..], 8)
	} else {
		(digits, 10)
	};
	let Ok(digits) = std::str::from_utf8(digits) else { return Value::default() };
	if !unsigned {
		if let Ok(v) = i64::from_str_radix(digits, radix) {
			return Value::Long(v);
		}
	}
	match u64::from_str_radix(digits, radix) {
		Ok(v) => Value::ULong(v),
		Err(_) => Value::default(),
	}
}

/// Binding power for precedence climbing; the ladder from `||` up to the
/// multiplicative operators. Ternary is handled separately, below `||`.
fn precedence(kind: Kind) -> i32 {
	match kind {
		Kind::PipePipe => 0,
		Kind::AmpAmp => 1,
		Kind::Pipe => 2,
		Kind::Caret => 3,
		Kind::Amp => 4,
		Kind::EqualEqual | Kind::ExclaimEqual => 5,
		Kind::Greater | Kind::Less | Kind::LessEqual | Kind::GreaterEqual => 6,
		Kind::LessLess | Kind::GreaterGreater => 7,
		Kind::Plus | Kind::Minus => 8,
		Kind::Star | Kind::Slash | Kind::Percent => 9,
		_ => -1,
	}
}

fn apply(kind: Kind, lhs: Value, rhs: Value) -> Value {
	match kind {
		Kind::PipePipe => lhs.logical_or(rhs),
		Kind::AmpAmp => lhs.logical_and(rhs),
		Kind::Pipe => lhs.bit_or(rhs),
		Kind::Caret => lhs.bit_xor(rhs),
		Kind::Amp => lhs.bit_and(rhs),
		Kind::EqualEqual => lhs.equal(rhs),
		Kind::ExclaimEqual => lhs.not_equal(rhs),
		Kind::Greater => lhs.greater(rhs),
		Kind::Less => lhs.less(rhs),
		Kind::LessEqual => lhs.less_equal(rhs),
		Kind::GreaterEqual => lhs.greater_equal(rhs),
		Kind::LessLess => lhs.shl(rhs),
		Kind::GreaterGreater => lhs.shr(rhs),
		Kind::Plus => lhs.add(rhs),
		Kind::Minus => lhs.sub(rhs),
		Kind::Star => lhs.mul(rhs),
		Kind::Slash => lhs.div(rhs),
		Kind::Percent => lhs.rem(rhs),
		_ => Value::default(),
	}
}

pub struct ExpressionEvaluator<'a> {
	client: Option<&'a mut dyn Client>,
	env: &'a Environment,
	tokens: &'a [PPToken],
	pos: usize,
	value: Value,
	bytes_offset_ref: u32,
	utf16_offset_ref: u32,
}

impl<'a> ExpressionEvaluator<'a> {
	/// `tokens` must end with an EOF token (the cursor parks there).
	pub fn new(client: Option<&'a mut dyn Client>, env: &'a Environment, tokens: &'a [PPToken]) -> Self {
		Self { client, env, tokens, pos: 0, value: Value::default(), bytes_offset_ref: 0, utf16_offset_ref: 0 }
	}

	/// Base offsets added to event positions when the expression is a
	/// slice of a larger translation unit.
	pub fn with_offsets(mut self, bytes_offset_ref: u32, utf16_offset_ref: u32) -> Self {
		self.bytes_offset_ref = bytes_offset_ref;
		self.utf16_offset_ref = utf16_offset_ref;
		self
	}

	pub fn evaluate(mut self) -> Value {
		self.constant_expression();
		debug!(value = ?self.value, "condition evaluated");
		self.value
	}

	fn cur(&self) -> &PPToken {
		self.tokens.get(self.pos).or_else(|| self.tokens.last()).expect("token range includes EOF")
	}

	fn advance(&mut self) {
		if self.pos + 1 < self.tokens.len() {
			self.pos += 1;
		}
	}

	fn is_defined_operator(&self) -> bool {
		self.cur().is(Kind::Identifier) && self.cur().text() == b"defined"
	}

	/// Resolve a `defined` query, reporting the check to the client.
	fn macro_definition_check(&mut self, tk: &PPToken) -> bool {
		let name = tk.text().to_vec();
		let bytes_offset = tk.byte_offset + self.bytes_offset_ref;
		let utf16_offset = tk.utf16_offset + self.utf16_offset_ref;
		match self.env.resolve(&name) {
			Some(mac) => {
				if let Some(client) = self.client.as_mut() {
					client.defined_check_passed(bytes_offset, utf16_offset, tk.line, mac);
				}
				true
			}
			None => {
				// Builtins are always defined but have no record to report.
				let bound = Environment::is_builtin_macro(&name);
				if !bound {
					if let Some(client) = self.client.as_mut() {
						client.defined_check_failed(bytes_offset, utf16_offset, &name);
					}
				}
				bound
			}
		}
	}

	fn primary(&mut self) {
		if self.cur().is(Kind::Number) {
			self.value = parse_integer(self.cur().text());
			self.advance();
		} else if self.is_defined_operator() {
			self.advance();
			let parenthesized = self.cur().is(Kind::LParen);
			if parenthesized {
				self.advance();
			}
			if self.cur().is(Kind::Identifier) {
				let tk = self.cur().clone();
				let defined = self.macro_definition_check(&tk);
				self.value = Value::Long(i64::from(defined));
				self.advance();
				if parenthesized && self.cur().is(Kind::RParen) {
					self.advance();
				}
			} else {
				self.value = Value::default();
			}
		} else if self.cur().is(Kind::Identifier) {
			// Any identifier that survived expansion is unbound: 0.
			self.value = Value::Long(0);
			self.advance();
		} else if self.cur().is(Kind::Minus) {
			self.advance();
			self.primary();
			self.value = Value::Long(0).sub(self.value);
		} else if self.cur().is(Kind::Plus) {
			self.advance();
			self.primary();
		} else if self.cur().is(Kind::Tilde) {
			self.advance();
			self.primary();
			self.value = match self.value {
				Value::Long(v) => Value::Long(!v),
				Value::ULong(v) => Value::ULong(!v),
			};
		} else if self.cur().is(Kind::Exclaim) {
			self.advance();
			self.primary();
			self.value = Value::Long(i64::from(self.value.is_zero()));
		} else if self.cur().is(Kind::LParen) {
			self.advance();
			self.constant_expression();
			if self.cur().is(Kind::RParen) {
				self.advance();
			}
		} else {
			// Stray punctuation evaluates as zero and is stepped over so
			// the cursor always makes progress.
			self.value = Value::default();
			self.advance();
		}
	}

	fn binary_expression(&mut self, lhs: Value, min_precedence: i32) -> Value {
		let mut result = lhs;
		while precedence(self.cur().kind) >= min_precedence {
			let oper = self.cur().kind;
			let oper_precedence = precedence(oper);
			self.advance();
			self.primary();
			let mut rhs = self.value;

			loop {
				let la = self.cur().kind;
				let la_precedence = precedence(la);
				if la_precedence <= oper_precedence {
					break;
				}
				rhs = self.binary_expression(rhs, la_precedence);
			}

			result = apply(oper, result, rhs);
		}
		result
	}

	fn constant_expression(&mut self) {
		self.primary();
		self.value = self.binary_expression(self.value, precedence(Kind::PipePipe));

		if self.cur().is(Kind::Question) {
			let cond = self.value;
			self.advance();
			self.constant_expression();
			let left = self.value;
			let mut right = Value::default();
			if self.cur().is(Kind::Colon) {
				self.advance();
				self.constant_expression();
				right = self.value;
			}
			self.value = if cond.is_zero() { right } else { left };
		}
	}
}
