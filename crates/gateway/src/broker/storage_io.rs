//! Document load and save pipelines.
//!
//! Loading: resolve the WOPI source, fetch the file description, take the
//! lock, download the contents, stage them into the worker's jail, and tell
//! the worker to open the copy. Saving: ask the worker to serialise, then
//! upload the serialised bytes to the host and classify the outcome. All
//! storage exchanges run as sockets on the broker's own poll; callbacks fire
//! on the broker thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_proto::tokens::Tokens;
use quill_proto::{ErrorKind, ProtocolError, SessionId};
use quill_storage::{FileInfo, LockOp, StorageError, WopiSource, classify_response};

use super::{
	BrokerState, DocumentBroker, MAX_LOCK_FAILURES, MAX_SAVE_RETRIES, Phase, SaveJob,
	LOCK_REFRESH_INTERVAL,
};

impl DocumentBroker {
	/// Handle a session's `load url=..`.
	pub(crate) fn handle_load(self: &Arc<Self>, state: &mut BrokerState, id: SessionId, url: &str) {
		if state.sessions.get(&id).is_some_and(|s| s.loaded) {
			self.protocol_error(state, id, &ProtocolError::new("load", ErrorKind::Syntax));
			return;
		}
		if let Some(session) = state.sessions.get_mut(&id) {
			session.loaded = true;
		}

		if state.source.is_none() && state.doc_bytes.is_none() {
			self.begin_document_load(state, id, url);
			return;
		}

		// Late joiner on an already-loading or live document.
		if state.phase != Phase::Loading {
			self.prepare_session_identity(state, id);
			if let Some(status) = state.doc_status.clone() {
				self.send_to_session(state, id, &status);
			}
		}
	}

	/// First load for the document: start the storage pipeline.
	fn begin_document_load(self: &Arc<Self>, state: &mut BrokerState, id: SessionId, url: &str) {
		self.broadcast(state, "statusindicator: loading");

		if let Some(path) = url.strip_prefix("file://") {
			if !self.config().storage.filesystem.allow {
				tracing::warn!(dockey = %self.key(), "filesystem storage disabled");
				self.send_to_session(
					state,
					id,
					&ProtocolError::new("load", ErrorKind::Unauthorized).to_message(),
				);
				self.enter_dead(state, "loadfailed");
				return;
			}
			let path = PathBuf::from(path);
			match std::fs::read(&path) {
				Ok(bytes) => {
					let name = path
						.file_name()
						.map(|n| n.to_string_lossy().into_owned())
						.unwrap_or_else(|| "document".to_string());
					state.file_info = Some(FileInfo {
						base_file_name: name.clone(),
						size: bytes.len() as i64,
						user_can_write: true,
						..FileInfo::default()
					});
					state.fs_origin = Some(path);
					state.doc_bytes = Some((name, bytes));
					self.prepare_session_identity(state, id);
					self.instruct_worker_load(state);
				}
				Err(e) => {
					tracing::warn!(dockey = %self.key(), error = %e, "local document unreadable");
					self.send_to_session(
						state,
						id,
						&ProtocolError::new("load", ErrorKind::Unavailable).to_message(),
					);
					self.enter_dead(state, "loadfailed");
				}
			}
			return;
		}

		let source = match WopiSource::new(url, self.proof()) {
			Ok(source) => source,
			Err(e) => {
				tracing::warn!(dockey = %self.key(), error = %e, "bad wopi source");
				self.protocol_error(state, id, &ProtocolError::new("load", ErrorKind::Syntax));
				return;
			}
		};

		let allowed = self
			.config()
			.wopi_hosts()
			.map(|hosts| self.config().storage.wopi.allow && hosts.is_allowed(source.host()))
			.unwrap_or(false);
		if !allowed {
			tracing::warn!(dockey = %self.key(), host = source.host(), "wopi host not allowed");
			self.send_to_session(
				state,
				id,
				&ProtocolError::new("load", ErrorKind::Unauthorized).to_message(),
			);
			self.enter_dead(state, "loadfailed");
			return;
		}

		state.source = Some(source.clone());
		let broker = Arc::clone(self);
		let request = source.file_info_request();
		let outcome = quill_storage::fetch(
			self.poll(),
			&request,
			self.tls(),
			self.config().wopi_timeout(),
			move |result| broker.on_file_info(id, result),
		);
		if let Err(e) = outcome {
			self.fail_load(state, &e);
		}
	}

	fn on_file_info(self: &Arc<Self>, id: SessionId, result: quill_storage::FetchResult) {
		let mut state = self.state().lock();
		if state.phase == Phase::Dead {
			return;
		}
		let info = match result
			.and_then(|r| classify_response(r.status, &r.body).map(|()| r))
			.and_then(|r| FileInfo::from_json(&r.body))
		{
			Ok(info) => info,
			Err(e) => {
				tracing::warn!(dockey = %self.key(), error = %e, "CheckFileInfo failed");
				self.fail_load(&mut state, &e);
				return;
			}
		};
		tracing::info!(dockey = %self.key(), file = %info.base_file_name, size = info.size, "file info fetched");

		if let Some(session) = state.sessions.get_mut(&id) {
			session.user_id = info.user_id.clone();
			session.user_name = info.user_friendly_name.clone();
			session.watermark = info.watermark_text.clone();
			if !info.user_can_write {
				session.read_only = true;
			}
		}

		let wants_lock = info.supports_locks;
		state.file_info = Some(info);

		if wants_lock {
			let token = uuid::Uuid::new_v4().simple().to_string();
			state.lock_token = Some(token.clone());
			state.last_lock_refresh = Instant::now();
			if let Some(source) = state.source.clone() {
				let broker = Arc::clone(self);
				let request = source.lock_request(LockOp::Lock, &token);
				let _ = quill_storage::fetch(
					self.poll(),
					&request,
					self.tls(),
					self.config().wopi_timeout(),
					move |result| broker.on_lock_taken(result),
				);
			}
		} else {
			self.fetch_contents(&mut state);
		}
	}

	fn on_lock_taken(self: &Arc<Self>, result: quill_storage::FetchResult) {
		let mut state = self.state().lock();
		if state.phase == Phase::Dead {
			return;
		}
		match result.and_then(|r| classify_response(r.status, &r.body)) {
			Ok(()) => {}
			Err(e) => {
				// Hosts differ on lock semantics; a refused lock degrades to
				// lockless operation rather than failing the open.
				tracing::warn!(dockey = %self.key(), error = %e, "lock not taken");
				state.lock_token = None;
			}
		}
		self.fetch_contents(&mut state);
	}

	fn fetch_contents(self: &Arc<Self>, state: &mut BrokerState) {
		let Some(source) = state.source.clone() else {
			return;
		};
		let broker = Arc::clone(self);
		let request = source.get_contents_request();
		let outcome = quill_storage::fetch(
			self.poll(),
			&request,
			self.tls(),
			self.config().wopi_timeout(),
			move |result| broker.on_contents(result),
		);
		if let Err(e) = outcome {
			self.fail_load(state, &e);
		}
	}

	fn on_contents(self: &Arc<Self>, result: quill_storage::FetchResult) {
		let mut state = self.state().lock();
		if state.phase == Phase::Dead {
			return;
		}
		match result.and_then(|r| classify_response(r.status, &r.body).map(|()| r.body)) {
			Ok(bytes) => {
				let name = state
					.file_info
					.as_ref()
					.map(|i| i.base_file_name.clone())
					.filter(|n| !n.is_empty())
					.unwrap_or_else(|| "document".to_string());
				tracing::info!(dockey = %self.key(), bytes = bytes.len(), "document downloaded");
				state.doc_bytes = Some((name, bytes));
				self.instruct_worker_load(&mut state);
			}
			Err(e) => {
				tracing::warn!(dockey = %self.key(), error = %e, "contents download failed");
				self.fail_load(&mut state, &e);
			}
		}
	}

	fn fail_load(&self, state: &mut BrokerState, error: &StorageError) {
		let message = format!("error: cmd=storage kind={}", error.client_kind());
		self.broadcast(state, &message);
		self.enter_dead(state, "loadfailed");
	}

	/// Stage the downloaded bytes into the worker's jail and tell it to
	/// open the copy. Needs both a worker and the bytes; called from
	/// whichever arrives second.
	pub(crate) fn instruct_worker_load(&self, state: &mut BrokerState) {
		let Some(worker) = &state.worker else {
			return;
		};
		let Some((name, bytes)) = &state.doc_bytes else {
			return;
		};

		let jail_root = self.config().child_root_path.join(&worker.jail_id);
		let doc_dir = jail_root.join("user").join("doc");
		if let Err(e) = std::fs::create_dir_all(&doc_dir) {
			tracing::error!(dockey = %self.key(), error = %e, "cannot build jail document dir");
			self.enter_dead(state, "resourcefailed");
			return;
		}
		let gateway_path = doc_dir.join(name);
		if let Err(e) = std::fs::write(&gateway_path, bytes) {
			tracing::error!(dockey = %self.key(), error = %e, "cannot stage document");
			self.enter_dead(state, "resourcefailed");
			return;
		}

		let worker_path = if worker.chrooted {
			PathBuf::from("/user/doc").join(name)
		} else {
			gateway_path.clone()
		};
		state.doc_path = Some(gateway_path);
		worker.queue.push_text(format!(
			"load doc={} name={name}",
			worker_path.display()
		));
		self.poll().wakeup();
	}

	/// Re-fetch this session's file description so its identity fields are
	/// its own; filesystem sources synthesise one.
	fn prepare_session_identity(self: &Arc<Self>, state: &mut BrokerState, id: SessionId) {
		match state.source.clone() {
			None => {
				if let Some(session) = state.sessions.get_mut(&id) {
					session.user_name = format!("local-{id}");
					session.user_id = session.user_name.clone();
				}
				self.request_view(state, id);
			}
			Some(source) => {
				let broker = Arc::clone(self);
				let request = source.file_info_request();
				let _ = quill_storage::fetch(
					self.poll(),
					&request,
					self.tls(),
					self.config().wopi_timeout(),
					move |result| {
						let mut state = broker.state().lock();
						if let Ok(response) = result
							&& let Ok(info) = FileInfo::from_json(&response.body)
							&& let Some(session) = state.sessions.get_mut(&id)
						{
							session.user_id = info.user_id;
							session.user_name = info.user_friendly_name;
							session.watermark = info.watermark_text;
							if !info.user_can_write {
								session.read_only = true;
							}
						}
						broker.request_view(&state, id);
					},
				);
			}
		}
	}

	/// Start a save. Only one may be in flight; an exit save rides on an
	/// existing one by forcing its exit flag.
	pub(crate) fn start_save(&self, state: &mut BrokerState, force: bool, autosave: bool, exit: bool) {
		if state.phase == Phase::Dead || state.phase == Phase::Loading {
			return;
		}
		if let Some(save) = state.save.as_mut() {
			if exit {
				save.exit_save = true;
			}
			tracing::debug!(dockey = %self.key(), "save already in flight");
			return;
		}
		if !state.modified && !force {
			return;
		}
		let Some(worker) = &state.worker else {
			tracing::warn!(dockey = %self.key(), "save requested without worker");
			return;
		};

		tracing::info!(dockey = %self.key(), autosave, exit, "save starting");
		state.phase = Phase::Saving;
		state.save = Some(SaveJob {
			autosave,
			exit_save: exit,
			started: Instant::now(),
			retry_at: None,
			attempts: 0,
		});
		worker.queue.push_text("savetofile");
		self.poll().wakeup();
	}

	/// The worker's save acknowledgement; the upload may begin.
	pub(crate) fn on_worker_saved(self: &Arc<Self>, tokens: &Tokens<'_>) {
		let ok = tokens.string_pair("result") == Some("ok");
		let mut state = self.state().lock();
		if state.save.is_none() {
			tracing::warn!(dockey = %self.key(), "unexpected save ack");
			return;
		}
		if !ok {
			self.save_failed(
				&mut state,
				&StorageError::Transient("worker failed to serialise".to_string()),
			);
			return;
		}
		self.upload_document(&mut state);
	}

	fn upload_document(self: &Arc<Self>, state: &mut BrokerState) {
		let Some(path) = state.doc_path.clone() else {
			self.save_failed(
				state,
				&StorageError::Transient("no document on disk".to_string()),
			);
			return;
		};
		let bytes = match std::fs::read(&path) {
			Ok(bytes) => bytes,
			Err(e) => {
				self.save_failed(
					state,
					&StorageError::Transient(format!("reading serialised document: {e}")),
				);
				return;
			}
		};

		// Filesystem sources write straight back.
		if let Some(origin) = state.fs_origin.clone() {
			match std::fs::write(&origin, &bytes) {
				Ok(()) => self.save_succeeded(state),
				Err(e) => self.save_failed(
					state,
					&StorageError::Transient(format!("writing local document: {e}")),
				),
			}
			return;
		}

		let Some(source) = state.source.clone() else {
			return;
		};
		let lock = state.lock_token.clone();
		let stamp = state
			.file_info
			.as_ref()
			.map(|i| i.last_modified_time.clone())
			.filter(|t| !t.is_empty());
		let request = source.put_contents_request(bytes, lock.as_deref(), stamp.as_deref());
		let broker = Arc::clone(self);
		let outcome = quill_storage::fetch(
			self.poll(),
			&request,
			self.tls(),
			self.config().wopi_timeout(),
			move |result| {
				let mut state = broker.state().lock();
				match result.and_then(|r| classify_response(r.status, &r.body)) {
					Ok(()) => broker.save_succeeded(&mut state),
					Err(e) => broker.save_failed(&mut state, &e),
				}
			},
		);
		if let Err(e) = outcome {
			self.save_failed(state, &e);
		}
	}

	fn save_succeeded(&self, state: &mut BrokerState) {
		tracing::info!(dockey = %self.key(), "save uploaded");
		state.stats.saves_completed += 1;
		state.modified = false;
		state.last_save = Some(Instant::now());
		let job = state.save.take();
		if state.phase == Phase::Saving {
			state.phase = Phase::Live;
		}
		if job.is_some_and(|j| j.exit_save) {
			self.release_lock(state);
			self.enter_dead(state, "saved");
		}
	}

	fn save_failed(&self, state: &mut BrokerState, error: &StorageError) {
		let retryable = error.is_transient();
		let attempts = state.save.as_ref().map_or(0, |j| j.attempts);

		if retryable && attempts < MAX_SAVE_RETRIES {
			if let Some(job) = state.save.as_mut() {
				job.attempts += 1;
				let backoff = Duration::from_secs(1 << job.attempts);
				job.retry_at = Some(Instant::now() + backoff);
				tracing::warn!(dockey = %self.key(), error = %error, attempt = job.attempts, "save failed, will retry");
			}
			return;
		}

		tracing::warn!(dockey = %self.key(), error = %error, "save failed, surfacing");
		let message = format!("error: cmd=storage kind={}", error.client_kind());
		self.broadcast(state, &message);
		if matches!(error, StorageError::DiskFull) {
			state.frozen = true;
		}
		let job = state.save.take();
		if state.phase == Phase::Saving {
			state.phase = Phase::Live;
		}
		if job.is_some_and(|j| j.exit_save) {
			self.release_lock(state);
			self.enter_dead(state, "savefailed");
		}
	}

	/// Retry and timeout bookkeeping for an in-flight save.
	pub(crate) fn save_progress_check(self: &Arc<Self>, state: &mut BrokerState, now: Instant) {
		enum Verdict {
			Idle,
			Retry,
			Waiting,
			TimedOut,
		}
		let verdict = match state.save.as_mut() {
			None => Verdict::Idle,
			Some(job) => match job.retry_at {
				Some(at) if now >= at => {
					job.retry_at = None;
					Verdict::Retry
				}
				Some(_) => Verdict::Waiting,
				None if now.duration_since(job.started) > self.config().save_timeout() => {
					Verdict::TimedOut
				}
				None => Verdict::Waiting,
			},
		};
		match verdict {
			Verdict::Idle | Verdict::Waiting => {}
			Verdict::Retry => self.upload_document(state),
			Verdict::TimedOut => {
				tracing::warn!(dockey = %self.key(), "save timed out");
				self.save_failed(
					state,
					&StorageError::Transient("save timed out".to_string()),
				);
			}
		}
	}

	/// Keep the storage lock fresh while Live.
	pub(crate) fn refresh_lock_check(self: &Arc<Self>, state: &mut BrokerState, now: Instant) {
		let Some(token) = state.lock_token.clone() else {
			return;
		};
		if now.duration_since(state.last_lock_refresh) < LOCK_REFRESH_INTERVAL {
			return;
		}
		state.last_lock_refresh = now;
		let Some(source) = state.source.clone() else {
			return;
		};
		let broker = Arc::clone(self);
		let request = source.lock_request(LockOp::Refresh, &token);
		let _ = quill_storage::fetch(
			self.poll(),
			&request,
			self.tls(),
			self.config().wopi_timeout(),
			move |result| {
				let mut state = broker.state().lock();
				match result.and_then(|r| classify_response(r.status, &r.body)) {
					Ok(()) => state.lock_failures = 0,
					Err(e) => {
						state.lock_failures += 1;
						tracing::warn!(dockey = %broker.key(), error = %e, failures = state.lock_failures, "lock refresh failed");
						if state.lock_failures >= MAX_LOCK_FAILURES {
							broker.enter_dead(&mut state, "lockfailed");
						}
					}
				}
			},
		);
	}

	/// Fire-and-forget UNLOCK at teardown.
	pub(crate) fn release_lock(&self, state: &mut BrokerState) {
		let Some(token) = state.lock_token.take() else {
			return;
		};
		let Some(source) = state.source.clone() else {
			return;
		};
		let request = source.lock_request(LockOp::Unlock, &token);
		let _ = quill_storage::fetch(
			self.poll(),
			&request,
			self.tls(),
			self.config().wopi_timeout(),
			|result| {
				if let Err(e) = result {
					tracing::debug!(error = %e, "unlock failed at teardown");
				}
			},
		);
	}
}
