//! Storage failure classification, autosave, and save settlement.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use super::helpers::{FakeWorker, StubWopiHost, TestSession, go_live, rig, rig_for_url, wait_until};
use crate::broker::Phase;

#[test]
fn autosave_fires_after_idle_and_writes_back() {
	let rig = rig();
	let session = TestSession::attach(&rig.broker, 1);
	let mut worker = go_live(&rig, &session);
	let _ = worker.sent();

	rig.broker
		.dispatch_client_message(session.id, "key type=input char=65 key=0");
	assert!(rig.broker.lock_state_for_test().modified);

	// Quiet until past the autosave window.
	let idle = rig.config.autosave_duration() + Duration::from_secs(1);
	rig.broker.on_tick(Instant::now() + idle);
	assert!(
		worker.sent().iter().any(|m| m == "savetofile"),
		"autosave never reached the worker"
	);

	// The worker serialises into the jail copy, then acks.
	let jail_copy = rig.broker.lock_state_for_test().doc_path.clone().unwrap();
	std::fs::write(&jail_copy, b"edited-bytes").unwrap();
	worker.ack_save();

	assert_eq!(std::fs::read(&rig.origin).unwrap(), b"edited-bytes");
	assert_eq!(rig.broker.phase(), Phase::Live);
	assert!(!rig.broker.lock_state_for_test().modified);
}

#[test]
fn wopi_load_round_trip_populates_file_info() {
	let host = StubWopiHost::start();
	let rig = rig_for_url(Some(host.wopi_src()));
	let session = TestSession::attach(&rig.broker, 1);
	session.load(&rig.broker, &host.wopi_src());

	let mut worker = FakeWorker::attach(&rig.broker);
	assert!(
		wait_until(
			|| worker.sent().iter().any(|m| m.starts_with("load doc=")),
			Duration::from_secs(5)
		),
		"document never reached the worker"
	);

	let state = rig.broker.lock_state_for_test();
	let info = state.file_info.as_ref().expect("no file info");
	assert_eq!(info.base_file_name, "hello.odt");
	assert_eq!(
		state.sessions.values().next().unwrap().user_name,
		"Ada"
	);
	drop(state);

	worker.complete_load();
	assert_eq!(rig.broker.phase(), Phase::Live);
}

#[test]
fn conflicting_upload_surfaces_and_stays_live() {
	let host = StubWopiHost::start();
	host.put_status.store(409, Ordering::SeqCst);

	let rig = rig_for_url(Some(host.wopi_src()));
	let mut session = TestSession::attach(&rig.broker, 1);
	session.load(&rig.broker, &host.wopi_src());
	let mut worker = FakeWorker::attach(&rig.broker);
	assert!(wait_until(
		|| worker.sent().iter().any(|m| m.starts_with("load doc=")),
		Duration::from_secs(5)
	));
	worker.complete_load();

	rig.broker
		.dispatch_client_message(session.id, "key type=input char=65 key=0");
	rig.broker.dispatch_client_message(session.id, "save");
	worker.ack_save();

	assert!(wait_until(
		|| session
			.texts()
			.iter()
			.any(|t| t == "error: cmd=storage kind=documentconflict"),
		Duration::from_secs(5)
	));
	assert_eq!(rig.broker.phase(), Phase::Live);

	// Conflicts are not retried.
	std::thread::sleep(Duration::from_millis(200));
	assert_eq!(host.put_count(), 1);
}

#[test]
fn transient_upload_failure_schedules_a_retry() {
	let host = StubWopiHost::start();
	host.put_status.store(503, Ordering::SeqCst);

	let rig = rig_for_url(Some(host.wopi_src()));
	let session = TestSession::attach(&rig.broker, 1);
	session.load(&rig.broker, &host.wopi_src());
	let mut worker = FakeWorker::attach(&rig.broker);
	assert!(wait_until(
		|| worker.sent().iter().any(|m| m.starts_with("load doc=")),
		Duration::from_secs(5)
	));
	worker.complete_load();

	rig.broker
		.dispatch_client_message(session.id, "key type=input char=65 key=0");
	rig.broker.dispatch_client_message(session.id, "save");
	worker.ack_save();

	assert!(wait_until(|| host.put_count() == 1, Duration::from_secs(5)));
	assert!(wait_until(
		|| {
			let state = rig.broker.lock_state_for_test();
			state.save.as_ref().is_some_and(|j| j.attempts == 1 && j.retry_at.is_some())
		},
		Duration::from_secs(5)
	));

	// Drive the clock past the backoff: a second attempt goes out.
	rig.broker.on_tick(Instant::now() + Duration::from_secs(10));
	assert!(wait_until(|| host.put_count() == 2, Duration::from_secs(5)));
}

#[test]
fn disk_full_freezes_further_modifications() {
	let host = StubWopiHost::start();
	host.put_status.store(507, Ordering::SeqCst);

	let rig = rig_for_url(Some(host.wopi_src()));
	let mut session = TestSession::attach(&rig.broker, 1);
	session.load(&rig.broker, &host.wopi_src());
	let mut worker = FakeWorker::attach(&rig.broker);
	assert!(wait_until(
		|| worker.sent().iter().any(|m| m.starts_with("load doc=")),
		Duration::from_secs(5)
	));
	worker.complete_load();

	rig.broker
		.dispatch_client_message(session.id, "key type=input char=65 key=0");
	rig.broker.dispatch_client_message(session.id, "save");
	worker.ack_save();

	assert!(wait_until(
		|| session.texts().iter().any(|t| t == "error: cmd=storage kind=diskfull"),
		Duration::from_secs(5)
	));
	assert!(rig.broker.lock_state_for_test().frozen);

	// Further edits are refused, not forwarded.
	let before = worker.sent().len();
	rig.broker
		.dispatch_client_message(session.id, "key type=input char=66 key=0");
	assert_eq!(worker.sent().len(), before);
	assert!(session
		.texts()
		.iter()
		.any(|t| t == "error: cmd=storage kind=diskfull"));
}

#[test]
fn shutdown_drain_settles_the_save() {
	let rig = rig();
	let session = TestSession::attach(&rig.broker, 1);
	let mut worker = go_live(&rig, &session);
	rig.broker
		.dispatch_client_message(session.id, "key type=input char=65 key=0");

	rig.broker.initiate_shutdown();
	assert!(
		worker.sent().iter().any(|m| m == "savetofile"),
		"shutdown dropped the pending save"
	);
	worker.ack_save();

	assert!(rig.broker.is_drained());
	assert_eq!(std::fs::read(&rig.origin).unwrap(), b"doc-bytes");
}
