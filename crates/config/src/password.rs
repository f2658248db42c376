//! Admin password hashing.
//!
//! Stored form: `pbkdf2.sha512.<iterations>.<salt-hex>.<hash-hex>`.

use hmac::Hmac;
use sha2::Sha512;

const SCHEME: &str = "pbkdf2.sha512";

/// Verify a cleartext candidate against a stored hash. Returns `false` for
/// malformed stored values rather than erroring; a bad hash locks the
/// console, it does not take the server down.
#[must_use]
pub fn verify(stored: &str, candidate: &str) -> bool {
	let Some(rest) = stored
		.strip_prefix(SCHEME)
		.and_then(|rest| rest.strip_prefix('.'))
	else {
		return false;
	};
	let mut parts = rest.split('.');
	let (Some(iterations), Some(salt_hex), Some(hash_hex), None) =
		(parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return false;
	};
	let Ok(iterations) = iterations.parse::<u32>() else {
		return false;
	};
	let (Some(salt), Some(expected)) = (decode_hex(salt_hex), decode_hex(hash_hex)) else {
		return false;
	};
	if iterations == 0 || expected.is_empty() {
		return false;
	}

	let mut derived = vec![0u8; expected.len()];
	if pbkdf2::pbkdf2::<Hmac<Sha512>>(candidate.as_bytes(), &salt, iterations, &mut derived)
		.is_err()
	{
		return false;
	}
	constant_time_eq(&derived, &expected)
}

/// Produce a stored hash for `password`.
#[must_use]
pub fn hash(password: &str, salt: &[u8], iterations: u32) -> Option<String> {
	let mut derived = [0u8; 64];
	pbkdf2::pbkdf2::<Hmac<Sha512>>(password.as_bytes(), salt, iterations, &mut derived).ok()?;
	Some(format!(
		"{SCHEME}.{iterations}.{}.{}",
		encode_hex(salt),
		encode_hex(&derived)
	))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b) {
		diff |= x ^ y;
	}
	diff == 0
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
	if s.len() % 2 != 0 {
		return None;
	}
	(0..s.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
		.collect()
}

fn encode_hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_then_verify() {
		let stored = hash("hunter2", b"0123456789abcdef", 1000).unwrap();
		assert!(stored.starts_with("pbkdf2.sha512."));
		assert!(verify(&stored, "hunter2"));
		assert!(!verify(&stored, "hunter3"));
	}

	#[test]
	fn accepts_the_stored_wire_format() {
		// The exact field layout the admin tooling writes:
		// pbkdf2.sha512.<iterations>.<salt-hex>.<hash-hex>
		let salt = b"0123456789abcdef";
		let stored = hash("s3cret", salt, 100).unwrap();
		let mut fields = stored.splitn(5, '.');
		assert_eq!(fields.next(), Some("pbkdf2"));
		assert_eq!(fields.next(), Some("sha512"));
		assert_eq!(fields.next(), Some("100"));
		assert_eq!(fields.next(), Some("30313233343536373839616263646566"));
		assert_eq!(fields.next().map(str::len), Some(128));
	}

	#[test]
	fn malformed_stored_values_fail_closed() {
		assert!(!verify("", "x"));
		assert!(!verify("pbkdf2.sha512.notanumber.aa.bb", "x"));
		assert!(!verify("pbkdf2.sha512.1000.zz.bb", "x"));
		assert!(!verify("pbkdf2.sha512.1000.aa.bb.extra", "x"));
		assert!(!verify("pbkdf2sha512.1000.aa.bb", "x"));
		assert!(!verify("pbkdf2.md5.1000.aa.bb", "x"));
	}
}
