//! Tile descriptors and combined tile bundles.
//!
//! A tile is a rectangular rendered region of one document part, addressed in
//! document-coordinate units. The descriptor doubles as the request grammar
//! (`tile part=.. width=..`) and the response header (`tile: part=.. ..`).
//! Version is carried but is not part of tile identity: a newer render of the
//! same rectangle replaces an older one.

use crate::error::{ErrorKind, ProtocolError};
use crate::tokens::{Tokens, name_value};

/// Identity of a tile: everything except version/id/broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
	pub part: i32,
	pub width: i32,
	pub height: i32,
	pub pos_x: i32,
	pub pos_y: i32,
	pub tile_width: i32,
	pub tile_height: i32,
}

/// Fingerprint of one requested or rendered tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDesc {
	/// Part (sheet/page/slide) index, `>= 0`.
	pub part: i32,
	/// Canvas width in pixels, `> 0`.
	pub width: i32,
	/// Canvas height in pixels, `> 0`.
	pub height: i32,
	/// Left edge in document-coordinate units, `>= 0`.
	pub pos_x: i32,
	/// Top edge in document-coordinate units, `>= 0`.
	pub pos_y: i32,
	/// Tile width in document-coordinate units, `> 0`.
	pub tile_width: i32,
	/// Tile height in document-coordinate units, `> 0`.
	pub tile_height: i32,
	/// Monotonic render version, `-1` when unset.
	pub ver: i32,
	/// Optional client-chosen id echoed back in responses, `-1` when unset.
	pub id: i32,
	/// Whether the response should go to every session, not just the requester.
	pub broadcast: bool,
}

impl TileDesc {
	/// Validate the dimensional invariants.
	fn validated(self, command: &str) -> Result<Self, ProtocolError> {
		if self.part < 0
			|| self.width <= 0
			|| self.height <= 0
			|| self.pos_x < 0
			|| self.pos_y < 0
			|| self.tile_width <= 0
			|| self.tile_height <= 0
		{
			return Err(ProtocolError::new(command, ErrorKind::Syntax));
		}
		Ok(self)
	}

	/// The cache identity of this tile.
	#[must_use]
	pub fn key(&self) -> TileKey {
		TileKey {
			part: self.part,
			width: self.width,
			height: self.height,
			pos_x: self.pos_x,
			pos_y: self.pos_y,
			tile_width: self.tile_width,
			tile_height: self.tile_height,
		}
	}

	/// Whether this tile overlaps the given rectangle (document units).
	#[must_use]
	pub fn intersects_rect(&self, x: i32, y: i32, w: i32, h: i32) -> bool {
		x + w >= self.pos_x
			&& x <= self.pos_x + self.tile_width
			&& y + h >= self.pos_y
			&& y <= self.pos_y + self.tile_height
	}

	/// Parse from a tokenized `tile` message.
	pub fn parse(tokens: &Tokens<'_>) -> Result<Self, ProtocolError> {
		let command = tokens.command().unwrap_or("tile");
		let int = |key: &str| -> Result<i32, ProtocolError> {
			Ok(tokens.require_int(key)? as i32)
		};
		let desc = Self {
			part: int("part")?,
			width: int("width")?,
			height: int("height")?,
			pos_x: int("tileposx")?,
			pos_y: int("tileposy")?,
			tile_width: int("tilewidth")?,
			tile_height: int("tileheight")?,
			ver: tokens.int_pair("ver")?.unwrap_or(-1) as i32,
			id: tokens.int_pair("id")?.unwrap_or(-1) as i32,
			broadcast: tokens.string_pair("broadcast") == Some("yes"),
		};
		desc.validated(command)
	}

	/// Serialize into the wire form, prefixed with `prefix` (no trailing space).
	#[must_use]
	pub fn serialize(&self, prefix: &str) -> String {
		let mut out = format!(
			"{prefix} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={} ver={}",
			self.part,
			self.width,
			self.height,
			self.pos_x,
			self.pos_y,
			self.tile_width,
			self.tile_height,
			self.ver,
		);
		if self.id >= 0 {
			out.push_str(&format!(" id={}", self.id));
		}
		if self.broadcast {
			out.push_str(" broadcast=yes");
		}
		out
	}
}

/// Ordered, non-empty set of tiles sharing part, canvas, and tile size.
///
/// The `tilecombine` grammar carries the shared fields once and the positions
/// as comma-separated lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBundle {
	tiles: Vec<TileDesc>,
}

impl TileBundle {
	/// Parse from a tokenized `tilecombine` message.
	pub fn parse(tokens: &Tokens<'_>) -> Result<Self, ProtocolError> {
		let command = tokens.command().unwrap_or("tilecombine");
		let syntax = || ProtocolError::new(command, ErrorKind::Syntax);

		let mut pos_x = "";
		let mut pos_y = "";
		let mut part = None;
		let mut width = None;
		let mut height = None;
		let mut tile_width = None;
		let mut tile_height = None;
		let mut ver = -1i32;
		let mut id = -1i32;
		for token in tokens.args() {
			let Some((name, value)) = name_value(token) else {
				continue;
			};
			match name {
				"tileposx" => pos_x = value,
				"tileposy" => pos_y = value,
				_ => {
					let v: i32 = value.parse().map_err(|_| syntax())?;
					match name {
						"part" => part = Some(v),
						"width" => width = Some(v),
						"height" => height = Some(v),
						"tilewidth" => tile_width = Some(v),
						"tileheight" => tile_height = Some(v),
						"ver" => ver = v,
						"id" => id = v,
						_ => {}
					}
				}
			}
		}

		let xs: Vec<i32> = split_ints(pos_x).ok_or_else(syntax)?;
		let ys: Vec<i32> = split_ints(pos_y).ok_or_else(syntax)?;
		if xs.is_empty() || xs.len() != ys.len() {
			return Err(syntax());
		}

		let mut tiles = Vec::with_capacity(xs.len());
		for (x, y) in xs.into_iter().zip(ys) {
			let desc = TileDesc {
				part: part.ok_or_else(syntax)?,
				width: width.ok_or_else(syntax)?,
				height: height.ok_or_else(syntax)?,
				pos_x: x,
				pos_y: y,
				tile_width: tile_width.ok_or_else(syntax)?,
				tile_height: tile_height.ok_or_else(syntax)?,
				ver,
				id,
				broadcast: false,
			};
			tiles.push(desc.validated(command)?);
		}
		Ok(Self { tiles })
	}

	/// Build a bundle from tiles already known to share identity fields.
	///
	/// Panics if `tiles` is empty; callers construct from at least one tile.
	#[must_use]
	pub fn from_tiles(tiles: Vec<TileDesc>) -> Self {
		assert!(!tiles.is_empty());
		Self { tiles }
	}

	#[must_use]
	pub fn tiles(&self) -> &[TileDesc] {
		&self.tiles
	}

	#[must_use]
	pub fn into_tiles(self) -> Vec<TileDesc> {
		self.tiles
	}

	/// Serialize into the combined wire form with the given prefix.
	#[must_use]
	pub fn serialize(&self, prefix: &str) -> String {
		let first = self.tiles[0];
		let xs: Vec<String> = self.tiles.iter().map(|t| t.pos_x.to_string()).collect();
		let ys: Vec<String> = self.tiles.iter().map(|t| t.pos_y.to_string()).collect();
		let ver = self.tiles.iter().map(|t| t.ver).max().unwrap_or(-1);
		let mut out = format!(
			"{prefix} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
			first.part,
			first.width,
			first.height,
			xs.join(","),
			ys.join(","),
			first.tile_width,
			first.tile_height,
		);
		if ver >= 0 {
			out.push_str(&format!(" ver={ver}"));
		}
		out
	}
}

fn split_ints(list: &str) -> Option<Vec<i32>> {
	list.split(',')
		.filter(|s| !s.is_empty())
		.map(|s| s.trim().parse().ok())
		.collect()
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use proptest::prelude::*;

	use super::*;

	fn desc(pos_x: i32, pos_y: i32) -> TileDesc {
		TileDesc {
			part: 0,
			width: 256,
			height: 256,
			pos_x,
			pos_y,
			tile_width: 3840,
			tile_height: 3840,
			ver: -1,
			id: -1,
			broadcast: false,
		}
	}

	#[test]
	fn parses_single_tile() {
		let line = "tile part=1 width=256 height=256 tileposx=0 tileposy=3840 tilewidth=3840 tileheight=3840 ver=7";
		let tokens = Tokens::new(line);
		let t = TileDesc::parse(&tokens).unwrap();
		assert_eq!(t.part, 1);
		assert_eq!(t.pos_y, 3840);
		assert_eq!(t.ver, 7);
		assert_eq!(t.id, -1);
	}

	#[test]
	fn rejects_nonpositive_dimensions() {
		let line = "tile part=0 width=0 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
		assert!(TileDesc::parse(&Tokens::new(line)).is_err());

		let line = "tile part=0 width=256 height=256 tileposx=-1 tileposy=0 tilewidth=3840 tileheight=3840";
		assert!(TileDesc::parse(&Tokens::new(line)).is_err());
	}

	#[test]
	fn key_ignores_version() {
		let mut a = desc(0, 0);
		let mut b = desc(0, 0);
		a.ver = 3;
		b.ver = 9;
		assert_eq!(a.key(), b.key());
	}

	#[test]
	fn combine_round_trip() {
		let bundle = TileBundle::from_tiles(vec![desc(0, 0), desc(3840, 0), desc(7680, 0)]);
		let line = bundle.serialize("tilecombine");
		let parsed = TileBundle::parse(&Tokens::new(&line)).unwrap();
		assert_eq!(parsed.tiles().len(), 3);
		assert_eq!(parsed.tiles()[2].pos_x, 7680);
	}

	#[test]
	fn combine_rejects_uneven_positions() {
		let line = "tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0 tilewidth=3840 tileheight=3840";
		assert!(TileBundle::parse(&Tokens::new(line)).is_err());
	}

	proptest! {
		#[test]
		fn serialize_parse_identity(
			part in 0..16i32,
			px in 0..100_000i32,
			py in 0..100_000i32,
			ver in -1..1000i32,
		) {
			let t = TileDesc { part, pos_x: px, pos_y: py, ver, ..desc(0, 0) };
			let line = t.serialize("tile");
			let parsed = TileDesc::parse(&Tokens::new(&line)).unwrap();
			prop_assert_eq!(t, parsed);
		}
	}
}
