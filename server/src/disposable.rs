//! Idle-object registry.
//!
//! Server-side identity and session objects opt into idle-based
//! destruction by registering here. The registry keeps weak references
//! only; it never extends a lifetime. One shared sweep task wakes up with
//! a period of the largest registered inactivity plus a small slack and
//! disposes every object whose last-used timestamp is older than its own
//! limit. When the registry drains completely, an `all_idle` notification
//! fires so the daemon can schedule its own exit.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::prelude::*;

/// Extra time added to the sweep period so objects are not reaped right
/// on their limit.
const SWEEP_SLACK: Duration = Duration::from_secs(2);
/// Sweep period while nothing is registered.
const EMPTY_PERIOD: Duration = Duration::from_secs(5);

pub trait Disposable: Send + Sync {
	/// Timestamp of the last operation that touched the object.
	fn last_used(&self) -> Instant;

	/// Maximum inactivity before the object becomes eligible.
	fn max_inactivity(&self) -> Duration;

	/// Whether the object currently wants to be destroyed when idle.
	/// Objects with in-flight work keep this false.
	fn auto_destruct(&self) -> bool;

	/// Destroys the object. Called at most once by the sweeper; the
	/// implementation drops the strong references keeping it alive.
	fn dispose(&self);
}

#[derive(Default)]
struct Entries {
	objects: Vec<Weak<dyn Disposable>>,
}

pub struct DisposableRegistry {
	entries: Mutex<Entries>,
	changed: Notify,
	all_idle: Notify,
}

impl Default for DisposableRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl DisposableRegistry {
	pub fn new() -> Self {
		DisposableRegistry {
			entries: Mutex::new(Entries::default()),
			changed: Notify::new(),
			all_idle: Notify::new(),
		}
	}

	pub fn register(&self, object: Weak<dyn Disposable>) {
		if let Ok(mut entries) = self.entries.lock() {
			entries.objects.push(object);
		}
		self.changed.notify_one();
	}

	pub fn len(&self) -> usize {
		self.entries.lock().map(|e| e.objects.iter().filter(|w| w.strong_count() > 0).count()).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Resolves the next time the registry drains to empty.
	pub async fn wait_all_idle(&self) {
		loop {
			let notified = self.all_idle.notified();
			if self.is_empty() {
				return;
			}
			notified.await;
		}
	}

	/// Current sweep period: largest registered inactivity plus slack.
	fn period(&self) -> Duration {
		let max = self
			.entries
			.lock()
			.ok()
			.and_then(|entries| {
				entries
					.objects
					.iter()
					.filter_map(Weak::upgrade)
					.map(|o| o.max_inactivity())
					.max()
			});
		match max {
			Some(max) => max + SWEEP_SLACK,
			None => EMPTY_PERIOD,
		}
	}

	/// One sweep pass: dispose timed-out objects, prune dead weak refs.
	/// Exposed for tests; the background task calls it on its own.
	pub fn sweep(&self) {
		let mut stale = Vec::new();
		let emptied;
		{
			let Ok(mut entries) = self.entries.lock() else { return };
			let was_empty = entries.objects.is_empty();
			entries.objects.retain(|weak| {
				let Some(object) = weak.upgrade() else { return false };
				if object.auto_destruct() && object.last_used().elapsed() >= object.max_inactivity()
				{
					stale.push(object);
					false
				} else {
					true
				}
			});
			emptied = !was_empty && entries.objects.is_empty();
		}

		for object in stale {
			debug!("disposing idle object");
			object.dispose();
		}
		if emptied {
			self.all_idle.notify_waiters();
		}
	}

	/// Runs the sweep loop until the registry is dropped by every owner.
	pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let registry = Arc::downgrade(self);
		tokio::spawn(async move {
			loop {
				let Some(strong) = registry.upgrade() else { break };
				let period = strong.period();
				tokio::select! {
					() = tokio::time::sleep(period) => strong.sweep(),
					// A registration may have raised the next period.
					() = strong.changed.notified() => {}
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};

	struct TestObject {
		created: Instant,
		limit: Duration,
		auto: AtomicBool,
		disposed: AtomicBool,
	}

	impl TestObject {
		fn new(limit: Duration) -> Arc<Self> {
			Arc::new(TestObject {
				created: Instant::now(),
				limit,
				auto: AtomicBool::new(true),
				disposed: AtomicBool::new(false),
			})
		}
	}

	impl Disposable for TestObject {
		fn last_used(&self) -> Instant {
			self.created
		}
		fn max_inactivity(&self) -> Duration {
			self.limit
		}
		fn auto_destruct(&self) -> bool {
			self.auto.load(Ordering::Relaxed)
		}
		fn dispose(&self) {
			self.disposed.store(true, Ordering::Relaxed);
		}
	}

	#[tokio::test]
	async fn sweep_disposes_only_expired_objects() {
		let registry = DisposableRegistry::new();
		let expired = TestObject::new(Duration::ZERO);
		let fresh = TestObject::new(Duration::from_secs(600));
		registry.register(Arc::downgrade(&expired) as Weak<dyn Disposable>);
		registry.register(Arc::downgrade(&fresh) as Weak<dyn Disposable>);

		registry.sweep();

		assert!(expired.disposed.load(Ordering::Relaxed));
		assert!(!fresh.disposed.load(Ordering::Relaxed));
		assert_eq!(registry.len(), 1);
	}

	#[tokio::test]
	async fn auto_destruct_false_protects_object() {
		let registry = DisposableRegistry::new();
		let object = TestObject::new(Duration::ZERO);
		object.auto.store(false, Ordering::Relaxed);
		registry.register(Arc::downgrade(&object) as Weak<dyn Disposable>);

		registry.sweep();
		assert!(!object.disposed.load(Ordering::Relaxed));
		assert_eq!(registry.len(), 1);
	}

	#[tokio::test]
	async fn dead_weak_refs_are_pruned() {
		let registry = DisposableRegistry::new();
		let object = TestObject::new(Duration::from_secs(600));
		registry.register(Arc::downgrade(&object) as Weak<dyn Disposable>);
		drop(object);

		registry.sweep();
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn all_idle_fires_when_registry_drains() {
		let registry = Arc::new(DisposableRegistry::new());
		let object = TestObject::new(Duration::ZERO);
		registry.register(Arc::downgrade(&object) as Weak<dyn Disposable>);

		let waiter = {
			let registry = Arc::clone(&registry);
			tokio::spawn(async move { registry.wait_all_idle().await })
		};
		tokio::task::yield_now().await;

		registry.sweep();
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("all_idle signalled")
			.expect("waiter finished");
	}
}

// vim: ts=4
