//! Tokenizer for the space-separated message grammar.
//!
//! Messages are split on single spaces with empty tokens dropped. `key=value`
//! pairs may appear in any order after the command token. Values never
//! contain spaces except for known variable-length commands, where the
//! caller takes the raw tail instead of a token.

use crate::error::{ErrorKind, ProtocolError};

/// A tokenized message. Borrows the input line.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
	line: &'a str,
	tokens: Vec<&'a str>,
}

impl<'a> Tokens<'a> {
	/// Tokenize a message line.
	#[must_use]
	pub fn new(line: &'a str) -> Self {
		Self {
			line,
			tokens: line.split(' ').filter(|t| !t.is_empty()).collect(),
		}
	}

	/// The command token, if the message is non-empty.
	#[must_use]
	pub fn command(&self) -> Option<&'a str> {
		self.tokens.first().copied()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.tokens.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.tokens.is_empty()
	}

	/// Positional access, command included at index 0.
	#[must_use]
	pub fn get(&self, index: usize) -> Option<&'a str> {
		self.tokens.get(index).copied()
	}

	/// Everything after the first `skip` tokens, as the raw unsplit tail.
	///
	/// Used by variable-length commands (`uno`, `saveas`) whose final
	/// argument may contain spaces.
	#[must_use]
	pub fn tail(&self, skip: usize) -> &'a str {
		let mut rest = self.line;
		for _ in 0..skip {
			rest = rest.trim_start_matches(' ');
			match rest.find(' ') {
				Some(pos) => rest = &rest[pos..],
				None => return "",
			}
		}
		rest.trim_start_matches(' ')
	}

	/// Look up the value of a `key=value` pair.
	#[must_use]
	pub fn string_pair(&self, key: &str) -> Option<&'a str> {
		self.tokens.iter().find_map(|t| {
			let rest = t.strip_prefix(key)?;
			rest.strip_prefix('=')
		})
	}

	/// Look up and parse an integer `key=value` pair.
	pub fn int_pair(&self, key: &str) -> Result<Option<i64>, ProtocolError> {
		match self.string_pair(key) {
			None => Ok(None),
			Some(v) => v.parse::<i64>().map(Some).map_err(|_| {
				ProtocolError::new(self.command().unwrap_or_default(), ErrorKind::Syntax)
			}),
		}
	}

	/// Like [`Tokens::int_pair`] but the pair must be present.
	pub fn require_int(&self, key: &str) -> Result<i64, ProtocolError> {
		self.int_pair(key)?.ok_or_else(|| {
			ProtocolError::new(self.command().unwrap_or_default(), ErrorKind::Syntax)
		})
	}

	/// Iterate over all tokens after the command.
	pub fn args(&self) -> impl Iterator<Item = &'a str> + '_ {
		self.tokens.iter().skip(1).copied()
	}
}

/// Split a `key=value` token, if it is one.
#[must_use]
pub fn name_value(token: &str) -> Option<(&str, &str)> {
	let pos = token.find('=')?;
	Some((&token[..pos], &token[pos + 1..]))
}
