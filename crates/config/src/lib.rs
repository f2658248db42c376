//! Configuration for the quill server.
//!
//! One XML file under the install prefix configures both the gateway and the
//! spawner. Parsing goes through serde into typed sections; every option has
//! a default so a minimal file (or none at all) yields a runnable debug
//! setup. Unknown elements are ignored with the section intact, type errors
//! fail the load.
//!
//! ```xml
//! <config>
//!     <ssl enable="true">
//!         <cert_file_path>/etc/quill/cert.pem</cert_file_path>
//!         <key_file_path>/etc/quill/key.pem</key_file_path>
//!     </ssl>
//!     <storage>
//!         <filesystem allow="false"/>
//!         <wopi allow="true">
//!             <host allow="true">office\.example\.com</host>
//!             <host allow="false">.*</host>
//!         </wopi>
//!     </storage>
//!     <net>
//!         <listen>127.0.0.1:9980</listen>
//!         <service_root></service_root>
//!     </net>
//!     <num_prespawn_children>1</num_prespawn_children>
//! </config>
//! ```

pub mod error;
pub mod hosts;
pub mod password;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use error::{ConfigError, Result};
pub use hosts::HostAllowList;

/// Fully parsed and validated server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename = "config")]
pub struct Config {
	pub ssl: SslConfig,
	pub storage: StorageConfig,
	pub net: NetConfig,
	pub per_document: PerDocumentConfig,
	pub logging: LoggingConfig,
	pub admin_console: AdminConsoleConfig,
	/// Number of pre-initialised workers kept warm by the spawner.
	pub num_prespawn_children: u32,
	/// Directory under which worker jails are built.
	pub child_root_path: PathBuf,
	/// Path of the render library loaded by workers.
	pub render_library_path: PathBuf,
	/// Volatile tile/bitmap cache directory.
	pub cache_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SslConfig {
	#[serde(rename = "@enable")]
	pub enable: bool,
	pub cert_file_path: PathBuf,
	pub key_file_path: PathBuf,
	/// CA bundle trusted for outbound storage connections.
	pub ca_file_path: Option<PathBuf>,
	pub cipher_list: String,
}

impl Default for SslConfig {
	fn default() -> Self {
		Self {
			enable: false,
			cert_file_path: PathBuf::from("cert.pem"),
			key_file_path: PathBuf::from("key.pem"),
			ca_file_path: None,
			cipher_list: String::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
	pub filesystem: FilesystemStorage,
	pub wopi: WopiStorage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesystemStorage {
	/// Whether `file://` sources are served. Debug setups only.
	#[serde(rename = "@allow")]
	pub allow: bool,
}

impl Default for FilesystemStorage {
	fn default() -> Self {
		Self { allow: false }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WopiStorage {
	#[serde(rename = "@allow")]
	pub allow: bool,
	/// Ordered host rules; the first matching rule decides.
	#[serde(rename = "host")]
	pub hosts: Vec<HostRule>,
	/// Timeout for one outbound storage request.
	pub timeout_secs: u64,
}

impl Default for WopiStorage {
	fn default() -> Self {
		Self {
			allow: true,
			hosts: Vec::new(),
			timeout_secs: 30,
		}
	}
}

/// One allow/deny regex over storage host names.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRule {
	#[serde(rename = "@allow")]
	pub allow: bool,
	#[serde(rename = "$text")]
	pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
	/// Listen address for the client port.
	pub listen: String,
	/// Path prefix under which the service is mounted.
	pub service_root: String,
	/// Opaque prefix inserted by fronting proxies, reconstructed in public
	/// URIs but ignored for routing.
	pub proxy_prefix: String,
}

impl Default for NetConfig {
	fn default() -> Self {
		Self {
			listen: "127.0.0.1:9980".to_string(),
			service_root: String::new(),
			proxy_prefix: String::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerDocumentConfig {
	/// Seconds a broker may sit idle (no sessions) before teardown.
	pub idle_timeout_secs: u64,
	/// Idle seconds after a modification before an autosave fires.
	pub autosave_duration_secs: u64,
	/// Upper bound on one save round-trip before it is reported failed.
	pub save_timeout_secs: u64,
}

impl Default for PerDocumentConfig {
	fn default() -> Self {
		Self {
			idle_timeout_secs: 3600,
			autosave_duration_secs: 300,
			save_timeout_secs: 120,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	/// Log filter; anything `tracing_subscriber::EnvFilter` accepts.
	pub level: String,
	pub file: LogFileConfig,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			file: LogFileConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogFileConfig {
	#[serde(rename = "property")]
	pub properties: Vec<LogFileProperty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogFileProperty {
	#[serde(rename = "@name")]
	pub name: String,
	#[serde(rename = "$text")]
	pub value: String,
}

impl LogFileConfig {
	/// The configured log file path, if any.
	#[must_use]
	pub fn path(&self) -> Option<&str> {
		self.properties
			.iter()
			.find(|p| p.name == "path")
			.map(|p| p.value.as_str())
	}
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminConsoleConfig {
	#[serde(rename = "@enable")]
	pub enable: bool,
	/// `pbkdf2.sha512.<iterations>.<salt-hex>.<hash-hex>`
	pub secure_password: String,
}

impl Config {
	/// Load and validate a configuration file.
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_xml(&text)
	}

	/// Parse configuration from an XML string.
	pub fn from_xml(text: &str) -> Result<Self> {
		let config: Self = quick_xml::de::from_str(text)?;
		// Compile the host rules now so bad patterns fail load, not save.
		let _ = config.wopi_hosts()?;
		Ok(config)
	}

	/// Built-in defaults, used when no config file is present.
	#[must_use]
	pub fn defaults() -> Self {
		Self {
			num_prespawn_children: 1,
			child_root_path: PathBuf::from("jails"),
			render_library_path: PathBuf::from("librender.so"),
			cache_path: PathBuf::from("cache"),
			..Self::default()
		}
	}

	/// Compiled host allow/deny list for WOPI sources.
	pub fn wopi_hosts(&self) -> Result<HostAllowList> {
		HostAllowList::compile(&self.storage.wopi.hosts)
	}

	#[must_use]
	pub fn wopi_timeout(&self) -> Duration {
		Duration::from_secs(self.storage.wopi.timeout_secs)
	}

	#[must_use]
	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.per_document.idle_timeout_secs)
	}

	#[must_use]
	pub fn autosave_duration(&self) -> Duration {
		Duration::from_secs(self.per_document.autosave_duration_secs)
	}

	#[must_use]
	pub fn save_timeout(&self) -> Duration {
		Duration::from_secs(self.per_document.save_timeout_secs)
	}
}
