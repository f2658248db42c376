//! The document-key → broker registry.
//!
//! One mutex guards the whole map; operations hold it for a hash lookup
//! only. The registry is the sole strong owner of brokers. A key whose
//! broker is mid-teardown blocks new arrivals on a condvar until the dead
//! broker is gone, so at no instant do two brokers (and therefore two
//! workers) exist for one key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use quill_proto::DocKey;

use crate::broker::DocumentBroker;

/// How long a new arrival waits for a dying broker to finish tearing down
/// before giving up on the session.
const TEARDOWN_WAIT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct BrokerRegistry {
	brokers: Mutex<HashMap<DocKey, Arc<DocumentBroker>>>,
	teardown: Condvar,
}

/// Outcome of a find-or-create.
pub enum Lookup {
	/// An existing live broker for the key.
	Existing(Arc<DocumentBroker>),
	/// The key was free; the caller's freshly built broker was inserted.
	Created(Arc<DocumentBroker>),
	/// A dead broker refused to leave within the teardown wait.
	Unavailable,
}

impl BrokerRegistry {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Find the broker for `key`, or create one with `build` if absent.
	///
	/// If the resident broker is Dead, waits for its removal and then
	/// creates a fresh one.
	pub fn find_or_create(
		self: &Arc<Self>,
		key: &DocKey,
		build: impl FnOnce() -> std::io::Result<Arc<DocumentBroker>>,
	) -> std::io::Result<Lookup> {
		let mut brokers = self.brokers.lock();
		loop {
			match brokers.get(key) {
				Some(broker) if !broker.is_dead() => {
					return Ok(Lookup::Existing(Arc::clone(broker)));
				}
				Some(_) => {
					// Mid-teardown; wait for remove() to signal.
					if self
						.teardown
						.wait_for(&mut brokers, TEARDOWN_WAIT)
						.timed_out() && brokers.get(key).is_some_and(|b| b.is_dead())
					{
						tracing::warn!(dockey = %key, "dead broker stuck in teardown");
						return Ok(Lookup::Unavailable);
					}
				}
				None => {
					let broker = build()?;
					brokers.insert(key.clone(), Arc::clone(&broker));
					tracing::info!(dockey = %key, total = brokers.len(), "broker created");
					return Ok(Lookup::Created(broker));
				}
			}
		}
	}

	/// Look up a live broker without creating one.
	#[must_use]
	pub fn get(&self, key: &DocKey) -> Option<Arc<DocumentBroker>> {
		self.brokers.lock().get(key).cloned()
	}

	/// Remove a broker and release anyone waiting out its teardown.
	pub fn remove(&self, key: &DocKey) {
		let removed = self.brokers.lock().remove(key);
		if removed.is_some() {
			tracing::info!(dockey = %key, "broker removed");
			self.teardown.notify_all();
		}
	}

	/// Snapshot of all current brokers, for shutdown drain and admin.
	#[must_use]
	pub fn all(&self) -> Vec<Arc<DocumentBroker>> {
		self.brokers.lock().values().cloned().collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.brokers.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.brokers.lock().is_empty()
	}
}
