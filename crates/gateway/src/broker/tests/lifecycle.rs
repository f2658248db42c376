//! Broker state machine and session lifecycle tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use quill_net::ws::OutboundQueue;
use quill_proto::DocKey;

use super::helpers::{FakeWorker, TestSession, go_live, rig};
use crate::broker::worker::WorkerChannel;
use crate::broker::{DocumentBroker, Phase};
use crate::registry::Lookup;

#[test]
fn loads_through_worker_and_goes_live() {
	let rig = rig();
	let mut session = TestSession::attach(&rig.broker, 1);
	session.load(&rig.broker, &rig.file_url());
	assert_eq!(rig.broker.phase(), Phase::Loading);

	let mut worker = FakeWorker::attach(&rig.broker);
	let sent = worker.sent();
	assert!(
		sent.iter().any(|m| m.starts_with("load doc=")),
		"worker never told to load: {sent:?}"
	);

	worker.complete_load();
	assert_eq!(rig.broker.phase(), Phase::Live);

	let texts = session.texts();
	assert!(texts.iter().any(|t| t == "statusindicator: loading"));
	assert!(texts.iter().any(|t| t.starts_with("status: type=text")));
}

#[test]
fn second_session_observes_same_status_line() {
	let rig = rig();
	let mut first = TestSession::attach(&rig.broker, 1);
	let worker = go_live(&rig, &first);

	let mut second = TestSession::attach(&rig.broker, 2);
	second.load(&rig.broker, &rig.file_url());

	let status_of = |texts: Vec<String>| {
		texts
			.into_iter()
			.find(|t| t.starts_with("status: "))
			.expect("no status line")
	};
	assert_eq!(status_of(first.texts()), status_of(second.texts()));
	drop(worker);
}

#[test]
fn only_one_worker_is_ever_accepted() {
	let rig = rig();
	let session = TestSession::attach(&rig.broker, 1);
	let _worker = go_live(&rig, &session);

	assert!(!FakeWorker::try_attach_another(&rig.broker));
}

#[test]
fn worker_loss_kills_broker_and_frees_the_key() {
	let rig = rig();
	let mut session = TestSession::attach(&rig.broker, 1);
	let _worker = go_live(&rig, &session);

	// The pipe handler reports the loss exactly like a real crash.
	let mut channel = WorkerChannel::new(Arc::clone(&rig.broker));
	quill_net::WsMessageHandler::on_disconnect(&mut channel);

	assert_eq!(rig.broker.phase(), Phase::Dead);
	assert!(session.was_shut_down());
	assert!(
		session.texts().iter().any(|t| t.contains("kind=unavailable")),
		"no error surfaced to the client"
	);

	// The key is free again: a reconnect builds a fresh broker.
	let key = DocKey::from_wopi_src(&rig.file_url()).unwrap();
	let lookup = rig
		.registry
		.find_or_create(&key, || {
			DocumentBroker::new(
				key.clone(),
				rig.file_url(),
				Arc::clone(&rig.config),
				None,
				None,
				Arc::clone(&rig.registry),
			)
		})
		.unwrap();
	assert!(matches!(lookup, Lookup::Created(_)));
}

#[test]
fn dead_broker_rejects_new_sessions() {
	let rig = rig();
	let session = TestSession::attach(&rig.broker, 1);
	let _worker = go_live(&rig, &session);

	let mut channel = WorkerChannel::new(Arc::clone(&rig.broker));
	quill_net::WsMessageHandler::on_disconnect(&mut channel);

	let queue = OutboundQueue::new();
	rig.broker.add_session(quill_proto::SessionId(9), Arc::clone(&queue));
	assert!(queue
		.drain()
		.iter()
		.any(|m| matches!(m, quill_net::ws::Outbound::Shutdown { .. })));
	assert_eq!(rig.broker.session_count(), 1);
}

#[test]
fn empty_broker_lingers_then_tears_down() {
	let rig = rig();
	let session = TestSession::attach(&rig.broker, 1);
	let worker = go_live(&rig, &session);
	rig.broker.remove_session(session.id);

	// Within the linger window the broker stays up...
	rig.broker.on_tick(Instant::now());
	assert_ne!(rig.broker.phase(), Phase::Dead);

	// ...and a tick past it tears the broker down.
	rig.broker.on_tick(Instant::now() + Duration::from_secs(30));
	assert_eq!(rig.broker.phase(), Phase::Dead);
	assert!(rig.registry.is_empty());
	drop(worker);
}

#[test]
fn last_writer_departure_saves_pending_changes() {
	let rig = rig();
	let mut first = TestSession::attach(&rig.broker, 1);
	let mut worker = go_live(&rig, &first);
	let _ = first.texts();

	let mut second = TestSession::attach(&rig.broker, 2);
	second.load(&rig.broker, &rig.file_url());

	rig.broker
		.dispatch_client_message(first.id, "key type=input char=65 key=0");
	assert!(rig.broker.lock_state_for_test().modified);

	rig.broker.remove_session(first.id);
	assert!(
		worker.sent().iter().any(|m| m == "savetofile"),
		"no save issued when the last writer left"
	);
	assert_eq!(rig.broker.phase(), Phase::Saving);
}

#[test]
fn participant_changes_are_broadcast() {
	let rig = rig();
	let mut first = TestSession::attach(&rig.broker, 1);
	let worker = go_live(&rig, &first);

	// The worker assigns the view; everyone learns about the participant.
	worker.reply(&format!("viewid: id={} viewid=0", first.id));
	assert!(
		first.texts().iter().any(|t| t.starts_with("viewinfo: ")),
		"no participant broadcast after view assignment"
	);
}

#[test]
fn disconnect_command_closes_the_session() {
	let rig = rig();
	let mut session = TestSession::attach(&rig.broker, 1);
	let _worker = go_live(&rig, &session);

	rig.broker.dispatch_client_message(session.id, "disconnect");
	assert!(session.was_shut_down());
}

#[test]
fn repeated_garbage_disconnects_the_offender() {
	let rig = rig();
	let mut session = TestSession::attach(&rig.broker, 1);
	let _worker = go_live(&rig, &session);

	for _ in 0..10 {
		rig.broker.dispatch_client_message(session.id, "no-such-command");
	}
	let texts = session.texts();
	assert!(texts.iter().any(|t| t.contains("kind=syntax")));
	assert!(session.was_shut_down());
}
