//! Per-broker tile cache with render coalescing.
//!
//! Tiles are keyed by geometry alone; version is payload. For any key at
//! most one render request is ever in flight to the worker: later requests
//! for the same key join the subscriber list and are answered by the same
//! bytes when the render lands. Entries with live subscribers are pinned
//! against eviction.

use std::collections::HashMap;
use std::sync::Arc;

use quill_proto::tile::{TileDesc, TileKey};
use quill_proto::SessionId;

/// Default per-broker byte budget for cached bitmaps.
pub const DEFAULT_BUDGET_BYTES: usize = 32 * 1024 * 1024;

/// Outcome of a tile request.
#[derive(Debug)]
pub enum TileAction {
	/// Serve these bytes (with the version that rendered them) immediately.
	Cached(Arc<Vec<u8>>, i32),
	/// The session was subscribed; a render request must go to the worker.
	Render(TileDesc),
	/// The session was subscribed; a render for this key is already in
	/// flight and will answer everyone.
	Joined,
}

/// What to do after the worker reports a failed render.
#[derive(Debug, PartialEq, Eq)]
pub enum RenderFailure {
	/// Ask the worker once more.
	Retry(TileDesc),
	/// Give up; notify these sessions and drop the subscription.
	GiveUp(Vec<SessionId>),
}

#[derive(Debug)]
struct CachedTile {
	data: Arc<Vec<u8>>,
	ver: i32,
	last_used: u64,
}

#[derive(Debug)]
struct Subscription {
	desc: TileDesc,
	sessions: Vec<SessionId>,
	retried: bool,
}

/// Invalidation scope, parsed from the worker's `invalidatetiles:` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationSpec {
	All,
	Part(i32),
	Rect {
		part: i32,
		x: i32,
		y: i32,
		width: i32,
		height: i32,
	},
}

impl InvalidationSpec {
	/// Parse the payload of an `invalidatetiles:` message.
	///
	/// Forms: `all`, `part=<n>`, or
	/// `part=<n> x=<..> y=<..> width=<..> height=<..>`.
	#[must_use]
	pub fn parse(payload: &str) -> Option<Self> {
		let tokens = quill_proto::Tokens::new(payload);
		if payload.trim() == "all" {
			return Some(Self::All);
		}
		let part = tokens.string_pair("part")?.parse().ok()?;
		match (
			tokens.string_pair("x"),
			tokens.string_pair("y"),
			tokens.string_pair("width"),
			tokens.string_pair("height"),
		) {
			(Some(x), Some(y), Some(w), Some(h)) => Some(Self::Rect {
				part,
				x: x.parse().ok()?,
				y: y.parse().ok()?,
				width: w.parse().ok()?,
				height: h.parse().ok()?,
			}),
			_ => Some(Self::Part(part)),
		}
	}

	fn matches(self, key: &TileKey) -> bool {
		match self {
			Self::All => true,
			Self::Part(part) => key.part == part,
			Self::Rect {
				part,
				x,
				y,
				width,
				height,
			} => {
				key.part == part
					&& x + width >= key.pos_x
					&& x <= key.pos_x + key.tile_width
					&& y + height >= key.pos_y
					&& y <= key.pos_y + key.tile_height
			}
		}
	}
}

/// Fingerprint→bitmap cache plus the in-flight subscription table.
#[derive(Debug)]
pub struct TileCache {
	tiles: HashMap<TileKey, CachedTile>,
	subscriptions: HashMap<TileKey, Subscription>,
	total_bytes: usize,
	budget_bytes: usize,
	tick: u64,
}

impl TileCache {
	#[must_use]
	pub fn new() -> Self {
		Self::with_budget(DEFAULT_BUDGET_BYTES)
	}

	#[must_use]
	pub fn with_budget(budget_bytes: usize) -> Self {
		Self {
			tiles: HashMap::new(),
			subscriptions: HashMap::new(),
			total_bytes: 0,
			budget_bytes,
			tick: 0,
		}
	}

	/// Handle a session's request for one tile.
	pub fn request(&mut self, desc: TileDesc, session: SessionId) -> TileAction {
		let key = desc.key();
		self.tick += 1;
		if let Some(entry) = self.tiles.get_mut(&key) {
			entry.last_used = self.tick;
			return TileAction::Cached(Arc::clone(&entry.data), entry.ver);
		}

		match self.subscriptions.get_mut(&key) {
			Some(sub) => {
				if !sub.sessions.contains(&session) {
					sub.sessions.push(session);
				}
				TileAction::Joined
			}
			None => {
				self.subscriptions.insert(
					key,
					Subscription {
						desc,
						sessions: vec![session],
						retried: false,
					},
				);
				TileAction::Render(desc)
			}
		}
	}

	/// Store a rendered tile. Returns the subscribers to fan out to (cleared
	/// afterwards) and the bytes to send them.
	pub fn save(&mut self, desc: &TileDesc, data: Vec<u8>) -> (Arc<Vec<u8>>, Vec<SessionId>) {
		let key = desc.key();
		self.tick += 1;

		let data = Arc::new(data);
		let replace = match self.tiles.get(&key) {
			// A stale render must not clobber a fresher one.
			Some(existing) => desc.ver >= existing.ver,
			None => true,
		};
		if replace {
			if let Some(old) = self.tiles.insert(
				key,
				CachedTile {
					data: Arc::clone(&data),
					ver: desc.ver,
					last_used: self.tick,
				},
			) {
				self.total_bytes -= old.data.len();
			}
			self.total_bytes += data.len();
		}

		let sessions = self
			.subscriptions
			.remove(&key)
			.map(|sub| sub.sessions)
			.unwrap_or_default();

		self.evict();
		(data, sessions)
	}

	/// Handle a failed render for `key`.
	pub fn render_failed(&mut self, key: TileKey) -> RenderFailure {
		match self.subscriptions.get_mut(&key) {
			Some(sub) if !sub.retried => {
				sub.retried = true;
				RenderFailure::Retry(sub.desc)
			}
			Some(_) => {
				let sub = self.subscriptions.remove(&key).unwrap();
				RenderFailure::GiveUp(sub.sessions)
			}
			None => RenderFailure::GiveUp(Vec::new()),
		}
	}

	/// Drop this session from every subscription. Renders already in flight
	/// complete into the cache but fan out to nobody it concerned.
	pub fn unsubscribe_session(&mut self, session: SessionId) {
		for sub in self.subscriptions.values_mut() {
			sub.sessions.retain(|s| *s != session);
		}
	}

	/// Remove matching cache entries and drop matching subscriptions,
	/// returning the sessions whose pending tiles disappeared (the client
	/// re-requests after the invalidation notice).
	pub fn invalidate(&mut self, spec: InvalidationSpec) -> Vec<SessionId> {
		let removed: Vec<TileKey> = self
			.tiles
			.keys()
			.filter(|k| spec.matches(k))
			.copied()
			.collect();
		for key in removed {
			if let Some(old) = self.tiles.remove(&key) {
				self.total_bytes -= old.data.len();
			}
		}

		let dropped: Vec<TileKey> = self
			.subscriptions
			.keys()
			.filter(|k| spec.matches(k))
			.copied()
			.collect();
		let mut woken = Vec::new();
		for key in dropped {
			if let Some(sub) = self.subscriptions.remove(&key) {
				woken.extend(sub.sessions);
			}
		}
		woken.sort_unstable();
		woken.dedup();
		woken
	}

	/// Cached bytes currently held.
	#[must_use]
	pub fn total_bytes(&self) -> usize {
		self.total_bytes
	}

	/// Whether a render for `key` is in flight.
	#[must_use]
	pub fn in_flight(&self, key: &TileKey) -> bool {
		self.subscriptions.contains_key(key)
	}

	fn evict(&mut self) {
		while self.total_bytes > self.budget_bytes {
			// Oldest unpinned entry; subscribers pin their keys.
			let victim = self
				.tiles
				.iter()
				.filter(|(k, _)| !self.subscriptions.contains_key(*k))
				.min_by_key(|(_, t)| t.last_used)
				.map(|(k, _)| *k);
			let Some(key) = victim else {
				break;
			};
			if let Some(old) = self.tiles.remove(&key) {
				self.total_bytes -= old.data.len();
			}
		}
	}
}

impl Default for TileCache {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn desc(x: i32, y: i32, ver: i32) -> TileDesc {
		TileDesc {
			part: 0,
			width: 256,
			height: 256,
			pos_x: x,
			pos_y: y,
			tile_width: 3840,
			tile_height: 3840,
			ver,
			id: -1,
			broadcast: false,
		}
	}

	#[test]
	fn second_request_joins_instead_of_rendering() {
		let mut cache = TileCache::new();
		let d = desc(0, 0, 1);
		assert!(matches!(cache.request(d, SessionId(1)), TileAction::Render(_)));
		assert!(matches!(cache.request(d, SessionId(2)), TileAction::Joined));
		assert!(cache.in_flight(&d.key()));

		let (_data, sessions) = cache.save(&d, vec![0xAB; 16]);
		assert_eq!(sessions, vec![SessionId(1), SessionId(2)]);
		assert!(!cache.in_flight(&d.key()));

		// Subscription list cleared after fan-out.
		let (_data, sessions) = cache.save(&d, vec![0xAC; 16]);
		assert!(sessions.is_empty());
	}

	#[test]
	fn cached_tile_served_without_render() {
		let mut cache = TileCache::new();
		let d = desc(0, 0, 1);
		cache.save(&d, vec![1, 2, 3]);
		match cache.request(d, SessionId(1)) {
			TileAction::Cached(data, ver) => {
				assert_eq!(*data, vec![1, 2, 3]);
				assert_eq!(ver, 1);
			}
			other => panic!("expected cached tile, got {other:?}"),
		}
	}

	#[test]
	fn newer_version_replaces_older() {
		let mut cache = TileCache::new();
		cache.save(&desc(0, 0, 2), vec![2]);
		cache.save(&desc(0, 0, 1), vec![1]);
		match cache.request(desc(0, 0, -1), SessionId(1)) {
			TileAction::Cached(data, ver) => {
				assert_eq!(*data, vec![2]);
				assert_eq!(ver, 2);
			}
			other => panic!("stale render replaced fresh tile: {other:?}"),
		}
	}

	#[test]
	fn invalidation_drops_matches_and_wakes_subscribers() {
		let mut cache = TileCache::new();
		cache.save(&desc(0, 0, 1), vec![0; 8]);
		let pending = desc(3840, 0, -1);
		cache.request(pending, SessionId(7));

		let woken = cache.invalidate(InvalidationSpec::Part(0));
		assert_eq!(woken, vec![SessionId(7)]);
		assert_eq!(cache.total_bytes(), 0);
		// The pre-invalidation bytes are gone: a fresh request re-renders.
		assert!(matches!(
			cache.request(desc(0, 0, -1), SessionId(7)),
			TileAction::Render(_)
		));
	}

	#[test]
	fn rect_invalidation_spares_distant_tiles() {
		let mut cache = TileCache::new();
		cache.save(&desc(0, 0, 1), vec![0; 8]);
		cache.save(&desc(100_000, 100_000, 1), vec![0; 8]);

		cache.invalidate(InvalidationSpec::Rect {
			part: 0,
			x: 0,
			y: 0,
			width: 100,
			height: 100,
		});
		assert!(matches!(
			cache.request(desc(0, 0, -1), SessionId(1)),
			TileAction::Render(_)
		));
		assert!(matches!(
			cache.request(desc(100_000, 100_000, -1), SessionId(1)),
			TileAction::Cached(..)
		));
	}

	#[test]
	fn eviction_respects_budget_and_pins() {
		let mut cache = TileCache::with_budget(100);
		cache.save(&desc(0, 0, 1), vec![0; 60]);
		// Pin the second key with a subscriber before its bytes arrive,
		// then complete it; the third insert must evict the first key.
		let pinned = desc(3840, 0, 1);
		cache.request(pinned, SessionId(1));
		cache.request(desc(7680, 0, 1), SessionId(2));
		cache.save(&desc(7680, 0, 1), vec![0; 60]);

		assert!(cache.total_bytes() <= 100);
		assert!(matches!(
			cache.request(desc(0, 0, -1), SessionId(3)),
			TileAction::Render(_) | TileAction::Joined
		));
	}

	#[test]
	fn render_failure_retries_once_then_gives_up() {
		let mut cache = TileCache::new();
		let d = desc(0, 0, 1);
		cache.request(d, SessionId(1));

		assert_eq!(cache.render_failed(d.key()), RenderFailure::Retry(d));
		assert_eq!(
			cache.render_failed(d.key()),
			RenderFailure::GiveUp(vec![SessionId(1)])
		);
	}

	#[test]
	fn canceltiles_drops_a_sessions_pending_requests() {
		let mut cache = TileCache::new();
		let d = desc(0, 0, 1);
		cache.request(d, SessionId(1));
		cache.request(d, SessionId(2));
		cache.unsubscribe_session(SessionId(1));

		let (_data, sessions) = cache.save(&d, vec![1]);
		assert_eq!(sessions, vec![SessionId(2)]);
	}

	#[test]
	fn invalidation_spec_parsing() {
		assert_eq!(InvalidationSpec::parse("all"), Some(InvalidationSpec::All));
		assert_eq!(
			InvalidationSpec::parse("part=3"),
			Some(InvalidationSpec::Part(3))
		);
		assert_eq!(
			InvalidationSpec::parse("part=0 x=10 y=20 width=30 height=40"),
			Some(InvalidationSpec::Rect {
				part: 0,
				x: 10,
				y: 20,
				width: 30,
				height: 40
			})
		);
		assert_eq!(InvalidationSpec::parse("nonsense"), None);
	}
}
