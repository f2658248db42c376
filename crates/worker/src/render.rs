//! Render-library binding.
//!
//! The actual rendering engine is a dynamically loaded native library with a
//! C-style view/render API; everything above it goes through the
//! [`RenderBackend`] trait so tests (and the spawner's no-library debug
//! mode) can run against a deterministic in-process stub instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use quill_proto::TileDesc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
	#[error("render library {0}: {1}")]
	Library(PathBuf, String),
	#[error("no document loaded")]
	NoDocument,
	#[error("render call failed: {0}")]
	Call(&'static str),
	#[error("document I/O: {0}")]
	Io(#[from] std::io::Error),
}

/// Basic facts about a loaded document.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
	pub doc_type: String,
	pub parts: i32,
	pub current_part: i32,
	/// Document size in document-coordinate units.
	pub width: i32,
	pub height: i32,
}

impl DocumentInfo {
	/// The `status:` line announced to clients.
	#[must_use]
	pub fn status_line(&self) -> String {
		format!(
			"status: type={} parts={} current={} width={} height={}",
			self.doc_type, self.parts, self.current_part, self.width, self.height
		)
	}
}

/// The seam to the rendering engine. One instance per worker process, used
/// only from the worker's main thread.
pub trait RenderBackend: Send {
	/// Open the document at `path`.
	fn load(&mut self, path: &Path) -> Result<DocumentInfo, RenderError>;

	/// Create a view for a new participant; returns the view id.
	fn create_view(&mut self) -> Result<i32, RenderError>;

	fn destroy_view(&mut self, view: i32);

	/// Render one tile into bitmap bytes.
	fn render_tile(&mut self, desc: &TileDesc) -> Result<Vec<u8>, RenderError>;

	/// Feed an input event (key/mouse/uno message) to a view. Returns
	/// whether the document became modified.
	fn post_input(&mut self, view: i32, message: &str) -> Result<bool, RenderError>;

	/// Serialise the document back to `path`.
	fn save(&mut self, path: &Path) -> Result<(), RenderError>;
}

/// The expensive once-per-process state, initialised by the spawner before
/// any fork so the pages are shared copy-on-write by every worker.
pub enum Preloaded {
	Native(Arc<libloading::Library>),
	Stub,
}

impl Preloaded {
	/// Load and warm the render library, or fall back to the stub when the
	/// path names no library (debug and test setups).
	pub fn init(path: &Path) -> Result<Self, RenderError> {
		if !path.exists() {
			tracing::warn!(path = %path.display(), "render library missing; using stub backend");
			return Ok(Self::Stub);
		}
		let library = unsafe { libloading::Library::new(path) }
			.map_err(|e| RenderError::Library(path.to_path_buf(), e.to_string()))?;
		// One-time global initialisation: locale tables, font discovery,
		// configuration registry. Everything it allocates becomes shared
		// pages after fork.
		unsafe {
			let init: libloading::Symbol<'_, unsafe extern "C" fn() -> i32> = library
				.get(b"render_init\0")
				.map_err(|e| RenderError::Library(path.to_path_buf(), e.to_string()))?;
			if init() != 0 {
				return Err(RenderError::Call("render_init"));
			}
		}
		tracing::info!(path = %path.display(), "render library pre-initialised");
		Ok(Self::Native(Arc::new(library)))
	}

	/// Build the per-worker backend over the preloaded state.
	#[must_use]
	pub fn backend(&self) -> Box<dyn RenderBackend> {
		match self {
			Self::Native(library) => Box::new(NativeBackend::new(Arc::clone(library))),
			Self::Stub => Box::new(StubBackend::default()),
		}
	}
}

/// Backend over the dynamically loaded engine.
struct NativeBackend {
	library: Arc<libloading::Library>,
	loaded: bool,
}

impl NativeBackend {
	fn new(library: Arc<libloading::Library>) -> Self {
		Self {
			library,
			loaded: false,
		}
	}

	unsafe fn symbol<T>(&self, name: &[u8]) -> Result<libloading::Symbol<'_, T>, RenderError> {
		unsafe {
			self.library
				.get(name)
				.map_err(|e| RenderError::Library(PathBuf::new(), e.to_string()))
		}
	}
}

impl RenderBackend for NativeBackend {
	fn load(&mut self, path: &Path) -> Result<DocumentInfo, RenderError> {
		let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes())
			.map_err(|_| RenderError::Call("document path"))?;
		let mut info = [0i32; 4];
		unsafe {
			let load: libloading::Symbol<
				'_,
				unsafe extern "C" fn(*const libc::c_char, *mut i32) -> i32,
			> = self.symbol(b"render_load_document\0")?;
			if load(c_path.as_ptr(), info.as_mut_ptr()) != 0 {
				return Err(RenderError::Call("render_load_document"));
			}
		}
		self.loaded = true;
		Ok(DocumentInfo {
			doc_type: match info[0] {
				1 => "spreadsheet",
				2 => "presentation",
				_ => "text",
			}
			.to_string(),
			parts: info[1].max(1),
			current_part: 0,
			width: info[2],
			height: info[3],
		})
	}

	fn create_view(&mut self) -> Result<i32, RenderError> {
		if !self.loaded {
			return Err(RenderError::NoDocument);
		}
		unsafe {
			let create: libloading::Symbol<'_, unsafe extern "C" fn() -> i32> =
				self.symbol(b"render_create_view\0")?;
			let view = create();
			if view < 0 {
				return Err(RenderError::Call("render_create_view"));
			}
			Ok(view)
		}
	}

	fn destroy_view(&mut self, view: i32) {
		unsafe {
			if let Ok(destroy) = self.symbol::<unsafe extern "C" fn(i32)>(b"render_destroy_view\0")
			{
				destroy(view);
			}
		}
	}

	fn render_tile(&mut self, desc: &TileDesc) -> Result<Vec<u8>, RenderError> {
		if !self.loaded {
			return Err(RenderError::NoDocument);
		}
		// RGBA canvas buffer filled by the engine.
		let mut pixels = vec![0u8; desc.width as usize * desc.height as usize * 4];
		unsafe {
			let paint: libloading::Symbol<
				'_,
				unsafe extern "C" fn(*mut u8, i32, i32, i32, i32, i32, i32, i32) -> i32,
			> = self.symbol(b"render_paint_tile\0")?;
			if paint(
				pixels.as_mut_ptr(),
				desc.width,
				desc.height,
				desc.part,
				desc.pos_x,
				desc.pos_y,
				desc.tile_width,
				desc.tile_height,
			) != 0
			{
				return Err(RenderError::Call("render_paint_tile"));
			}
		}
		Ok(pixels)
	}

	fn post_input(&mut self, view: i32, message: &str) -> Result<bool, RenderError> {
		let c_msg = std::ffi::CString::new(message).map_err(|_| RenderError::Call("input"))?;
		unsafe {
			let post: libloading::Symbol<
				'_,
				unsafe extern "C" fn(i32, *const libc::c_char) -> i32,
			> = self.symbol(b"render_post_message\0")?;
			match post(view, c_msg.as_ptr()) {
				n if n < 0 => Err(RenderError::Call("render_post_message")),
				0 => Ok(false),
				_ => Ok(true),
			}
		}
	}

	fn save(&mut self, path: &Path) -> Result<(), RenderError> {
		let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes())
			.map_err(|_| RenderError::Call("save path"))?;
		unsafe {
			let save: libloading::Symbol<'_, unsafe extern "C" fn(*const libc::c_char) -> i32> =
				self.symbol(b"render_save\0")?;
			if save(c_path.as_ptr()) != 0 {
				return Err(RenderError::Call("render_save"));
			}
		}
		Ok(())
	}
}

/// Deterministic in-process backend for tests and library-less setups.
#[derive(Default)]
pub struct StubBackend {
	doc: Option<Vec<u8>>,
	views: Vec<i32>,
	next_view: i32,
	edits: u64,
}

impl RenderBackend for StubBackend {
	fn load(&mut self, path: &Path) -> Result<DocumentInfo, RenderError> {
		let bytes = std::fs::read(path)?;
		let size = bytes.len();
		self.doc = Some(bytes);
		Ok(DocumentInfo {
			doc_type: "text".to_string(),
			parts: 1,
			current_part: 0,
			width: 12240,
			height: (size.max(1) as i32).saturating_mul(16).max(15840),
		})
	}

	fn create_view(&mut self) -> Result<i32, RenderError> {
		if self.doc.is_none() {
			return Err(RenderError::NoDocument);
		}
		let view = self.next_view;
		self.next_view += 1;
		self.views.push(view);
		Ok(view)
	}

	fn destroy_view(&mut self, view: i32) {
		self.views.retain(|v| *v != view);
	}

	fn render_tile(&mut self, desc: &TileDesc) -> Result<Vec<u8>, RenderError> {
		let doc = self.doc.as_ref().ok_or(RenderError::NoDocument)?;
		// Deterministic bytes: same geometry and same document state, same
		// bitmap. Edits change the output, which exercises invalidation.
		Ok(format!(
			"stub-tile part={} x={} y={} w={} h={} doc={} edits={}",
			desc.part,
			desc.pos_x,
			desc.pos_y,
			desc.tile_width,
			desc.tile_height,
			doc.len(),
			self.edits,
		)
		.into_bytes())
	}

	fn post_input(&mut self, _view: i32, message: &str) -> Result<bool, RenderError> {
		let modifies = matches!(
			message.split(' ').next().unwrap_or_default(),
			"key" | "mouse" | "uno"
		);
		if modifies {
			self.edits += 1;
			if let Some(doc) = self.doc.as_mut() {
				doc.extend_from_slice(b"!");
			}
		}
		Ok(modifies)
	}

	fn save(&mut self, path: &Path) -> Result<(), RenderError> {
		let doc = self.doc.as_ref().ok_or(RenderError::NoDocument)?;
		std::fs::write(path, doc)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn desc() -> TileDesc {
		TileDesc {
			part: 0,
			width: 256,
			height: 256,
			pos_x: 0,
			pos_y: 0,
			tile_width: 3840,
			tile_height: 3840,
			ver: 1,
			id: -1,
			broadcast: false,
		}
	}

	#[test]
	fn stub_round_trip() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("doc.odt");
		std::fs::write(&path, b"content").unwrap();

		let mut backend = StubBackend::default();
		let info = backend.load(&path).unwrap();
		assert_eq!(info.parts, 1);
		assert!(info.status_line().starts_with("status: type=text parts=1"));

		let view = backend.create_view().unwrap();
		assert_eq!(view, 0);

		let a = backend.render_tile(&desc()).unwrap();
		let b = backend.render_tile(&desc()).unwrap();
		assert_eq!(a, b, "identical state must render identical bytes");

		assert!(backend.post_input(view, "key type=input char=65 key=0").unwrap());
		let c = backend.render_tile(&desc()).unwrap();
		assert_ne!(a, c, "an edit must change the rendering");

		let out = tmp.path().join("saved.odt");
		backend.save(&out).unwrap();
		assert_eq!(std::fs::read(&out).unwrap(), b"content!");
	}

	#[test]
	fn stub_requires_a_document() {
		let mut backend = StubBackend::default();
		assert!(backend.create_view().is_err());
		assert!(backend.render_tile(&desc()).is_err());
	}

	#[test]
	fn missing_library_falls_back_to_stub() {
		let preloaded = Preloaded::init(std::path::Path::new("/nonexistent/librender.so")).unwrap();
		assert!(matches!(preloaded, Preloaded::Stub));
	}
}
