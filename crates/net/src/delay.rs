//! Latency-injecting socket relay for tests.
//!
//! Sits between two endpoints and forwards traffic after a fixed delay, so
//! tests can exercise timeout and liveness behaviour without a real slow
//! network. Test harness only; nothing in the server runtime uses this.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Create a connected pair whose traffic in both directions is delayed by
/// `latency`. Relay threads exit when either endpoint closes.
pub fn delayed_pair(latency: Duration) -> std::io::Result<(UnixStream, UnixStream)> {
	let (a_outer, a_inner) = UnixStream::pair()?;
	let (b_inner, b_outer) = UnixStream::pair()?;

	spawn_relay(a_inner.try_clone()?, b_inner.try_clone()?, latency);
	spawn_relay(b_inner, a_inner, latency);

	Ok((a_outer, b_outer))
}

fn spawn_relay(mut from: UnixStream, mut to: UnixStream, latency: Duration) {
	std::thread::spawn(move || {
		let mut buf = [0u8; 4096];
		loop {
			match from.read(&mut buf) {
				Ok(0) | Err(_) => break,
				Ok(n) => {
					std::thread::sleep(latency);
					if to.write_all(&buf[..n]).is_err() {
						break;
					}
				}
			}
		}
		let _ = to.shutdown(std::net::Shutdown::Write);
	});
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use super::*;

	#[test]
	fn round_trip_pays_the_latency() {
		let latency = Duration::from_millis(30);
		let (mut a, mut b) = delayed_pair(latency).unwrap();

		let started = Instant::now();
		a.write_all(b"probe").unwrap();
		let mut buf = [0u8; 5];
		b.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"probe");
		assert!(started.elapsed() >= latency);
	}
}
