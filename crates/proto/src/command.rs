//! Typed view of inbound client commands.
//!
//! The gateway only needs structural knowledge of the commands it consumes
//! itself (document load, tile traffic, saves, liveness). Everything else is
//! validated as a known command and forwarded to the worker verbatim.

use crate::error::{ErrorKind, ProtocolError};
use crate::tile::{TileBundle, TileDesc};
use crate::tokens::Tokens;

/// Commands the gateway handles itself or must recognise before forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
	/// `load url=<wopi-src>` plus optional session options.
	Load {
		url: String,
		readonly: bool,
		lang: Option<String>,
	},
	/// `tile <desc>` — request one tile.
	Tile(TileDesc),
	/// `tilecombine <...>` — request a batch of tiles.
	TileCombine(TileBundle),
	/// `canceltiles` — drop this session's pending tile subscriptions.
	CancelTiles,
	/// `save` — explicit save request.
	Save,
	/// `saveas url=<wopi-url>` — save a copy to another location.
	SaveAs { url: String },
	/// `ping` — client liveness probe, answered locally.
	Ping,
	/// `disconnect` — orderly session close.
	Disconnect,
	/// Any other known command; forwarded to the worker as-is.
	Forward,
}

/// Commands forwarded to the worker without structural parsing.
const FORWARDED: &[&str] = &[
	"status",
	"key",
	"mouse",
	"setclientpart",
	"clientvisiblearea",
	"uno",
	"renderfont",
	"commandvalues",
];

impl ClientCommand {
	/// Parse one client message line.
	pub fn parse(line: &str) -> Result<Self, ProtocolError> {
		let tokens = Tokens::new(line);
		let Some(command) = tokens.command() else {
			return Err(ProtocolError::new("", ErrorKind::Syntax));
		};
		match command {
			"load" => {
				let url = tokens
					.string_pair("url")
					.ok_or_else(|| ProtocolError::new("load", ErrorKind::Syntax))?;
				Ok(Self::Load {
					url: url.to_string(),
					readonly: tokens.string_pair("readonly") == Some("1"),
					lang: tokens.string_pair("lang").map(str::to_string),
				})
			}
			"tile" => Ok(Self::Tile(TileDesc::parse(&tokens)?)),
			"tilecombine" => Ok(Self::TileCombine(TileBundle::parse(&tokens)?)),
			"canceltiles" => Ok(Self::CancelTiles),
			"save" => Ok(Self::Save),
			"saveas" => {
				let url = tokens
					.string_pair("url")
					.ok_or_else(|| ProtocolError::new("saveas", ErrorKind::Syntax))?;
				Ok(Self::SaveAs {
					url: url.to_string(),
				})
			}
			"ping" => Ok(Self::Ping),
			"disconnect" => Ok(Self::Disconnect),
			_ if FORWARDED.contains(&command) => Ok(Self::Forward),
			_ => Err(ProtocolError::new(command, ErrorKind::Syntax)),
		}
	}
}
