//! Storage host allow/deny matching.

use regex::Regex;

use crate::error::{ConfigError, Result};
use crate::HostRule;

/// Compiled, ordered host rules. The first rule whose pattern matches the
/// whole host name decides; with no match the host is denied.
#[derive(Debug, Clone)]
pub struct HostAllowList {
	rules: Vec<(bool, Regex)>,
}

impl HostAllowList {
	pub fn compile(rules: &[HostRule]) -> Result<Self> {
		let mut compiled = Vec::with_capacity(rules.len());
		for rule in rules {
			let anchored = format!("^(?:{})$", rule.pattern.trim());
			let regex = Regex::new(&anchored).map_err(|error| ConfigError::InvalidHostRule {
				pattern: rule.pattern.clone(),
				error,
			})?;
			compiled.push((rule.allow, regex));
		}
		Ok(Self { rules: compiled })
	}

	/// Whether `host` may serve documents.
	///
	/// An empty rule list allows everything; deployments lock this down in
	/// production configs.
	#[must_use]
	pub fn is_allowed(&self, host: &str) -> bool {
		if self.rules.is_empty() {
			return true;
		}
		for (allow, regex) in &self.rules {
			if regex.is_match(host) {
				return *allow;
			}
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(allow: bool, pattern: &str) -> HostRule {
		HostRule {
			allow,
			pattern: pattern.to_string(),
		}
	}

	#[test]
	fn first_match_wins() {
		let list = HostAllowList::compile(&[
			rule(true, r"office\.example\.com"),
			rule(false, ".*"),
		])
		.unwrap();
		assert!(list.is_allowed("office.example.com"));
		assert!(!list.is_allowed("other.example.com"));
	}

	#[test]
	fn no_match_denies() {
		let list = HostAllowList::compile(&[rule(true, r"a\.example")]).unwrap();
		assert!(!list.is_allowed("b.example"));
	}

	#[test]
	fn empty_list_allows() {
		let list = HostAllowList::compile(&[]).unwrap();
		assert!(list.is_allowed("anything"));
	}

	#[test]
	fn patterns_are_anchored() {
		let list = HostAllowList::compile(&[rule(true, "example"), rule(false, ".*")]).unwrap();
		assert!(!list.is_allowed("example.com"));
	}
}
