use std::sync::{
	atomic::{AtomicBool, AtomicU8, Ordering},
	Arc, Weak,
};

use parking_lot::Mutex;

use crate::{
	context::Context,
	delayed::DelayedPromise,
	promise::{Promise, Resolver, Shared},
};

/// Where a work unit is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
	/// Not yet started.
	Initial,
	/// `main` is (or is about to be) running.
	Executing,
	/// Done, whatever the outcome.
	Finished,
}

impl Phase {
	fn from_bits(bits: u8) -> Self {
		match bits {
			0 => Self::Initial,
			1 => Self::Executing,
			2 => Self::Finished,
			_ => unreachable!("corrupt phase word"),
		}
	}
}

/// A phase-change notification, bracketing the store that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
	/// Fires just before the phase word is written.
	WillSet(Phase),
	/// Fires just after the phase word is written.
	DidSet(Phase),
}

type PhaseObserver = Arc<dyn Fn(PhaseEvent) + Send + Sync>;

/// An operation's lifecycle storage: the atomic phase word and the
/// state-change observer slot a host queue can wire.
///
/// # Logic
///
/// Phase accesses are `Relaxed` throughout. An operation is meant to be
/// embedded in a host scheduler, and it is that scheduler's responsibility
/// to provide the publication edges between the thread that stores a phase
/// and the threads that poll it.
#[derive(Default)]
pub struct OperationState {
	phase: AtomicU8,
	observer: Mutex<Option<PhaseObserver>>,
}

impl OperationState {
	/// Creates lifecycle storage at [`Phase::Initial`] with no observer.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// The current phase.
	#[must_use]
	pub fn phase(&self) -> Phase {
		Phase::from_bits(self.phase.load(Ordering::Relaxed))
	}

	/// Wires `observer` to receive a [`PhaseEvent`] pair around every
	/// subsequent phase store.
	pub fn set_observer(&self, observer: impl Fn(PhaseEvent) + Send + Sync + 'static) {
		*self.observer.lock() = Some(Arc::new(observer));
	}

	/// Stores `phase`, bracketed by
	/// [`WillSet`](`PhaseEvent::WillSet`)/[`DidSet`](`PhaseEvent::DidSet`)
	/// notifications.
	pub fn set_phase(&self, phase: Phase) {
		self.notify(PhaseEvent::WillSet(phase));
		self.phase.store(phase as u8, Ordering::Relaxed);
		self.notify(PhaseEvent::DidSet(phase));
	}

	fn notify(&self, event: PhaseEvent) {
		// Cloned out so the observer may re-wire the slot without
		// deadlocking.
		let observer = self.observer.lock().clone();
		if let Some(observer) = observer {
			observer(event);
		}
	}
}

impl std::fmt::Debug for OperationState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OperationState")
			.field("phase", &self.phase())
			.finish()
	}
}

/// A work unit a host queue can start and poll, in the
/// is-ready/is-executing/is-finished mould.
pub trait Operation: Send + Sync {
	/// The operation's lifecycle storage.
	fn lifecycle(&self) -> &OperationState;

	/// The unit of work. Hook for implementers; the default finishes
	/// immediately.
	///
	/// # Panics
	///
	/// Panics when called outside [`start`](`Operation::start`).
	fn main(&self) {
		assert_eq!(
			self.lifecycle().phase(),
			Phase::Executing,
			"`main` called outside `start`"
		);
		self.lifecycle().set_phase(Phase::Finished);
	}

	/// Moves an initial operation to [`Phase::Executing`] and runs
	/// [`main`](`Operation::main`); returns immediately on an operation in
	/// any other phase.
	fn start(&self) {
		if self.lifecycle().phase() == Phase::Initial {
			self.lifecycle().set_phase(Phase::Executing);
			self.main();
		}
	}

	/// Whether the host may start this operation. Always true here;
	/// dependency tracking belongs to the host.
	fn is_ready(&self) -> bool {
		true
	}

	/// Whether `main` is running.
	fn is_executing(&self) -> bool {
		self.lifecycle().phase() == Phase::Executing
	}

	/// Whether the operation finished.
	fn is_finished(&self) -> bool {
		self.lifecycle().phase() == Phase::Finished
	}
}

/// A cancellable, queue-schedulable promise whose handler runs only once the
/// operation is started.
///
/// The promise obtained from [`promise`](`PromiseOperation::promise`) is
/// live immediately, but stays pending until a host starts the operation.
/// Cancelling the operation — or requesting cancellation of the promise —
/// before that point settles the promise as cancelled without the handler
/// ever running; afterwards, the request reaches the handler's resolver
/// cooperatively.
pub struct PromiseOperation<T: Clone + Send + 'static, E: Clone + Send + 'static> {
	state: OperationState,
	cancelled: AtomicBool,
	delayed: DelayedPromise<T, E>,
	child: Promise<T, E>,
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> PromiseOperation<T, E> {
	/// Creates an operation that will dispatch `handler` on `context` when
	/// started.
	pub fn new(
		context: Arc<dyn Context>,
		handler: impl FnOnce(Resolver<T, E>) + Send + 'static,
	) -> Arc<Self> {
		let (child, child_resolver) = Promise::with_resolver();
		Arc::new_cyclic(|weak: &Weak<Self>| {
			let delayed = DelayedPromise::new(context, {
				let child_resolver = child_resolver.clone();
				move |inner: Resolver<T, E>| {
					// Wire the child's cancellation through to the inner
					// promise before the handler sees its resolver. Internal
					// plumbing registers directly — not via a context — so a
					// request that already landed on the child reaches the
					// (by now `Empty`) inner box before the handler runs.
					Shared::push_cancel_handler(
						&child_resolver.shared,
						Box::new({
							let inner = inner.clone();
							move |_| {
								Shared::request_cancel(&inner.shared);
							}
						}),
					);
					handler(inner);
				}
			});
			// The inner promise's resolution flows outward into the child.
			Shared::push_observer(
				&delayed.shared,
				false,
				Box::new({
					let child_resolver = child_resolver.clone();
					move |result| {
						child_resolver.resolve(result.clone());
					}
				}),
			);
			// Finish the operation on any outcome.
			Shared::push_observer(
				&child.shared,
				false,
				Box::new({
					let weak = weak.clone();
					move |_| {
						if let Some(operation) = weak.upgrade() {
							operation.state.set_phase(Phase::Finished);
						}
					}
				}),
			);
			// A cancellation request against the child cancels the
			// operation, unless the operation itself originated it.
			Shared::push_cancel_handler(
				&child_resolver.shared,
				Box::new({
					let weak = weak.clone();
					move |_| {
						if let Some(operation) = weak.upgrade() {
							if !operation.cancelled.load(Ordering::Relaxed) {
								operation.cancel();
							}
						}
					}
				}),
			);
			Self {
				state: OperationState::new(),
				cancelled: AtomicBool::new(false),
				delayed,
				child,
			}
		})
	}

	/// A view of the promise this operation backs.
	#[must_use]
	pub fn promise(&self) -> Promise<T, E> {
		self.child.clone()
	}

	/// Cancels the operation: sets the cancelled flag, then requests
	/// cancellation of the promise.
	///
	/// The flag goes first so the child's cancel observer doesn't loop the
	/// request back here.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::Relaxed);
		self.child.request_cancel();
	}

	/// Whether [`cancel`](`PromiseOperation::cancel`) was called.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::Relaxed)
	}
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> Operation for PromiseOperation<T, E> {
	fn lifecycle(&self) -> &OperationState {
		&self.state
	}

	fn main(&self) {
		// The inner box can't have left `Delayed` yet (realisation happens
		// right here), so there is no pre-start state to check: a
		// cancellation that raced ahead is parked on the child's closed
		// request list and reaches the inner box during realisation.
		self.delayed.execute();
	}
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> Drop for PromiseOperation<T, E> {
	fn drop(&mut self) {
		// An operation that never ran still settles its promise: realise and
		// cancel in one move. A no-op if `main` got there first.
		self.delayed.empty_and_cancel();
	}
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> std::fmt::Debug
	for PromiseOperation<T, E>
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PromiseOperation")
			.field("phase", &self.state.phase())
			.field("cancelled", &self.cancelled.load(Ordering::Relaxed))
			.finish()
	}
}
