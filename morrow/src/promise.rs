use std::{
	cell::UnsafeCell,
	fmt::{self, Debug, Formatter},
	future::Future,
	ptr,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};

use futures_channel::oneshot;
use overmorrow::{
	promise_box::{PromiseBox, State},
	stack::Swapped,
};
use scopeguard::guard;
use tap::Pipe;

use crate::context::{Context, Immediate};

/// The outcome of a settled promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseResult<T, E> {
	/// The promise produced a value.
	Fulfilled(T),
	/// The promise produced an error.
	Rejected(E),
	/// The promise was cancelled before it could produce either.
	Cancelled,
}

impl<T, E> PromiseResult<T, E> {
	/// The fulfilled value, if any.
	pub fn value(self) -> Option<T> {
		match self {
			Self::Fulfilled(value) => Some(value),
			_ => None,
		}
	}

	/// The rejection error, if any.
	pub fn error(self) -> Option<E> {
		match self {
			Self::Rejected(error) => Some(error),
			_ => None,
		}
	}

	/// Whether the promise was cancelled.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}
}

pub(crate) type BoxedObserver<T, E> = Box<dyn FnOnce(&PromiseResult<T, E>) + Send>;

pub(crate) struct ObserverNode<T, E> {
	next: *mut ObserverNode<T, E>,
	counted: bool,
	callback: BoxedObserver<T, E>,
}

pub(crate) type BoxedCancelHandler<T, E> = Box<dyn FnOnce(Resolver<T, E>) + Send>;

pub(crate) struct CancelNode<T: Send + 'static, E: Send + 'static> {
	next: *mut CancelNode<T, E>,
	callback: BoxedCancelHandler<T, E>,
}

unsafe fn release_observer_chain<T, E>(mut head: *mut ObserverNode<T, E>) {
	while !head.is_null() {
		let node = Box::from_raw(head);
		head = node.next;
	}
}

unsafe fn release_cancel_chain<T: Send + 'static, E: Send + 'static>(mut head: *mut CancelNode<T, E>) {
	while !head.is_null() {
		let node = Box::from_raw(head);
		head = node.next;
	}
}

/// The state every view of one promise shares: the box machinery, the value
/// slot and the outstanding-resolver count.
pub(crate) struct Shared<T: Send + 'static, E: Send + 'static> {
	pub(crate) box_: PromiseBox<ObserverNode<T, E>, CancelNode<T, E>>,
	value: UnsafeCell<Option<PromiseResult<T, E>>>,
	resolvers: AtomicUsize,
}

// The value slot is written once, by the single thread that claimed
// `Resolving`, and read only behind a fenced state read observing `Resolved`.
unsafe impl<T: Send + 'static, E: Send + 'static> Send for Shared<T, E> {}
unsafe impl<T: Send + 'static, E: Send + 'static> Sync for Shared<T, E> {}

impl<T: Send + 'static, E: Send + 'static> Shared<T, E> {
	pub(crate) fn new(initial: State, resolvers: usize) -> Arc<Self> {
		Arc::new(Self {
			box_: PromiseBox::new(initial),
			value: UnsafeCell::new(None),
			resolvers: AtomicUsize::new(resolvers),
		})
	}

	/// Settles the box with a value or error.
	///
	/// Returns `false` if another settlement (or a resolution in flight) got
	/// there first.
	pub(crate) fn resolve(this: &Arc<Self>, result: PromiseResult<T, E>) -> bool {
		if result.is_cancelled() {
			return Self::cancel(this);
		}
		if !this.box_.transition(State::Resolving) {
			return false;
		}
		// Sole owner of the box until `Resolved`: nothing races this write,
		// and the Release transition publishes it.
		unsafe { *this.value.get() = Some(result) };
		assert!(this.box_.transition(State::Resolved), "unreachable");
		Self::drain_settled(this);
		true
	}

	/// Settles the box as cancelled, from `Empty` or `Cancelling`.
	pub(crate) fn cancel(this: &Arc<Self>) -> bool {
		if !this.box_.transition(State::Cancelled) {
			return false;
		}
		Self::drain_settled(this);
		true
	}

	/// Asks the resolver side to cancel: `Empty → Cancelling`, then every
	/// registered cancel handler runs once.
	///
	/// Requests against a `Delayed` box are rejected by the transition table
	/// and silently ignored, and only the first request against a live box
	/// drains the handlers.
	pub(crate) fn request_cancel(this: &Arc<Self>) -> bool {
		if !this.box_.transition(State::Cancelling) {
			return false;
		}
		if let Swapped::Prior(head) = this.box_.request_cancel().close() {
			// Release the rest of the chain even if a handler panics.
			let mut cursor = guard(head, |head| unsafe { release_cancel_chain(head) });
			while !cursor.is_null() {
				let CancelNode { next, callback } = *unsafe { Box::from_raw(*cursor) };
				*cursor = next;
				callback(Resolver::retained(this));
			}
		}
		true
	}

	/// Closes and drains both stacks of a just-settled box.
	///
	/// Exactly one thread gets here per box: the one whose transition
	/// committed the terminal state.
	fn drain_settled(this: &Arc<Self>) {
		// Cancel requests are moot once settled.
		if let Swapped::Prior(head) = this.box_.request_cancel().close() {
			unsafe { release_cancel_chain(head) };
		}
		let cancelled = PromiseResult::Cancelled;
		let result = match this.box_.state() {
			State::Resolved => unsafe { (*this.value.get()).as_ref() }.expect("unreachable"),
			State::Cancelled => &cancelled,
			_ => unreachable!("draining an unsettled box"),
		};
		if let Swapped::Prior(head) = this.box_.callbacks().close() {
			let mut cursor = guard(head, |head| unsafe { release_observer_chain(head) });
			while !cursor.is_null() {
				let ObserverNode {
					next,
					counted,
					callback,
				} = *unsafe { Box::from_raw(*cursor) };
				*cursor = next;
				callback(result);
				if counted {
					// The box is already settled and drained here, so the
					// last-observer signal has nothing left to release.
					let _ = this.box_.observers().decrement();
				}
			}
		}
	}

	/// Registers an observer callback, or runs it on the spot if the box has
	/// already settled.
	///
	/// `counted` observers participate in the observer counter and thereby
	/// keep the promise from auto-cancelling; uncounted ones (taps) don't.
	pub(crate) fn push_observer(this: &Arc<Self>, counted: bool, callback: BoxedObserver<T, E>) {
		if counted {
			this.box_.observers().increment();
		}
		let node = Box::new(ObserverNode {
			next: ptr::null_mut(),
			counted,
			callback,
		})
		.pipe(Box::into_raw);
		match this.box_.callbacks().swap(node, |head| unsafe { (*node).next = head }) {
			Swapped::Prior(_) => {}
			Swapped::Closed => {
				// The closed stack's Acquire edge makes the settled state and
				// value visible; deliver directly.
				let ObserverNode {
					counted, callback, ..
				} = *unsafe { Box::from_raw(node) };
				let cancelled = PromiseResult::Cancelled;
				let result = match this.box_.state() {
					State::Resolved => {
						unsafe { (*this.value.get()).as_ref() }.expect("unreachable")
					}
					State::Cancelled => &cancelled,
					_ => unreachable!("open state behind a closed callback stack"),
				};
				callback(result);
				if counted {
					let _ = this.box_.observers().decrement();
				}
			}
		}
	}

	/// Registers a cancel handler, or runs it on the spot if cancellation
	/// was already requested. Handlers registered after settlement are
	/// dropped unrun.
	pub(crate) fn push_cancel_handler(this: &Arc<Self>, callback: BoxedCancelHandler<T, E>) {
		let node = Box::new(CancelNode {
			next: ptr::null_mut(),
			callback,
		})
		.pipe(Box::into_raw);
		match this
			.box_
			.request_cancel()
			.swap(node, |head| unsafe { (*node).next = head })
		{
			Swapped::Prior(_) => {}
			Swapped::Closed => {
				let CancelNode { callback, .. } = *unsafe { Box::from_raw(node) };
				match this.box_.unfenced_state() {
					State::Cancelling => callback(Resolver::retained(this)),
					_ => drop(callback),
				}
			}
		}
	}
}

impl<T: Send + 'static, E: Send + 'static> Drop for Shared<T, E> {
	fn drop(&mut self) {
		// The box never settled and every handle vanished: release whatever
		// was registered, without invoking it.
		if let Swapped::Prior(head) = self.box_.callbacks().close() {
			unsafe { release_observer_chain(head) };
		}
		if let Swapped::Prior(head) = self.box_.request_cancel().close() {
			unsafe { release_cancel_chain(head) };
		}
	}
}

/// Seals the observer counter when the last `Promise` view goes away.
pub(crate) struct Seal<T: Send + 'static, E: Send + 'static> {
	pub(crate) shared: Arc<Shared<T, E>>,
}

impl<T: Send + 'static, E: Send + 'static> Drop for Seal<T, E> {
	fn drop(&mut self) {
		let observers = self.shared.box_.observers();
		// A sealed box with no observers left — or one that never had any —
		// can't be heard anymore; ask it to cancel if it's still pending.
		if observers.seal() || observers.is_unobserved() {
			Shared::request_cancel(&self.shared);
		}
	}
}

/// The consumer view of a promise: observe its outcome, or ask it to cancel.
///
/// Clones observe the same underlying box. When the last clone is dropped
/// and no counted observer remains, a still-pending promise is asked to
/// cancel itself.
#[must_use = "dropping the last handle of a pending promise requests its cancellation"]
pub struct Promise<T: Send + 'static, E: Send + 'static> {
	pub(crate) shared: Arc<Shared<T, E>>,
	pub(crate) seal: Arc<Seal<T, E>>,
}

impl<T: Send + 'static, E: Send + 'static> Clone for Promise<T, E> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
			seal: Arc::clone(&self.seal),
		}
	}
}

impl<T: Send + 'static, E: Send + 'static> Promise<T, E> {
	/// Creates a pending promise along with the resolver that settles it.
	pub fn with_resolver() -> (Self, Resolver<T, E>) {
		let shared = Shared::new(State::Empty, 1);
		(
			Self::over(Arc::clone(&shared)),
			Resolver { shared },
		)
	}

	pub(crate) fn over(shared: Arc<Shared<T, E>>) -> Self {
		Self {
			seal: Arc::new(Seal {
				shared: Arc::clone(&shared),
			}),
			shared,
		}
	}

	/// Creates a promise whose `handler` is dispatched on `context` right
	/// away.
	pub fn run(
		context: &dyn Context,
		handler: impl FnOnce(Resolver<T, E>) + Send + 'static,
	) -> Self {
		let (promise, resolver) = Self::with_resolver();
		context.execute(Box::new(move || handler(resolver)));
		promise
	}

	/// Registers `observer` to run on `context` once this promise settles.
	///
	/// Counts towards the observer total: as long as the observation is
	/// outstanding the promise won't auto-cancel.
	pub fn observe(
		&self,
		context: Arc<dyn Context>,
		observer: impl FnOnce(PromiseResult<T, E>) + Send + 'static,
	) where
		T: Clone,
		E: Clone,
	{
		Shared::push_observer(
			&self.shared,
			true,
			Box::new(move |result| {
				let result = result.clone();
				context.execute(Box::new(move || observer(result)));
			}),
		);
	}

	/// Like [`observe`](`Promise::observe`), but without joining the observer
	/// count — a tap never keeps a promise alive.
	pub fn tap(
		&self,
		context: Arc<dyn Context>,
		observer: impl FnOnce(PromiseResult<T, E>) + Send + 'static,
	) where
		T: Clone,
		E: Clone,
	{
		Shared::push_observer(
			&self.shared,
			false,
			Box::new(move |result| {
				let result = result.clone();
				context.execute(Box::new(move || observer(result)));
			}),
		);
	}

	/// Asks the resolver side to cancel.
	///
	/// Cooperative: registered cancel handlers run, and the resolver decides
	/// whether to honour the request or still deliver a resolution. Requests
	/// against an unrealised delayed promise are ignored.
	pub fn request_cancel(&self) {
		Shared::request_cancel(&self.shared);
	}

	/// The current lifecycle state.
	#[must_use]
	pub fn state(&self) -> State {
		self.shared.box_.state()
	}

	/// The settled result, or `None` while pending.
	#[must_use]
	pub fn result(&self) -> Option<PromiseResult<T, E>>
	where
		T: Clone,
		E: Clone,
	{
		match self.shared.box_.state() {
			State::Resolved => unsafe { (*self.shared.value.get()).clone() },
			State::Cancelled => Some(PromiseResult::Cancelled),
			_ => None,
		}
	}

	/// Bridges this promise into a [`Future`].
	///
	/// The future resolves once the promise settles. It counts as an
	/// observer for as long as it's pending.
	pub fn into_future(self) -> impl Future<Output = PromiseResult<T, E>>
	where
		T: Clone,
		E: Clone,
	{
		let (sender, receiver) = oneshot::channel();
		self.observe(Arc::new(Immediate), move |result| {
			let _ = sender.send(result);
		});
		async move { receiver.await.unwrap_or(PromiseResult::Cancelled) }
	}
}

impl<T: Send + 'static, E: Send + 'static> Debug for Promise<T, E> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Promise")
			.field("state", &self.shared.box_.unfenced_state())
			.finish()
	}
}

/// The producer view of a promise: settle it, or learn that cancellation was
/// requested.
///
/// Clones settle the same underlying box; the first settlement wins. If the
/// last resolver is dropped without settling, the promise is cancelled.
pub struct Resolver<T: Send + 'static, E: Send + 'static> {
	pub(crate) shared: Arc<Shared<T, E>>,
}

impl<T: Send + 'static, E: Send + 'static> Resolver<T, E> {
	pub(crate) fn retained(shared: &Arc<Shared<T, E>>) -> Self {
		shared.resolvers.fetch_add(1, Ordering::Relaxed);
		Self {
			shared: Arc::clone(shared),
		}
	}

	/// Fulfills the promise with `value`. Returns `false` if it had already
	/// settled or a resolution was in flight.
	pub fn fulfill(&self, value: T) -> bool {
		Shared::resolve(&self.shared, PromiseResult::Fulfilled(value))
	}

	/// Rejects the promise with `error`. Returns `false` if it had already
	/// settled or a resolution was in flight.
	pub fn reject(&self, error: E) -> bool {
		Shared::resolve(&self.shared, PromiseResult::Rejected(error))
	}

	/// Cancels the promise. Returns `false` if it had already settled or a
	/// resolution was in flight.
	pub fn cancel(&self) -> bool {
		Shared::cancel(&self.shared)
	}

	/// Settles the promise with `result`, whichever variant it is.
	pub fn resolve(&self, result: PromiseResult<T, E>) -> bool {
		Shared::resolve(&self.shared, result)
	}

	/// Whether cancellation has been requested (or has happened).
	///
	/// Long-running handlers **should** poll this and honour it.
	#[must_use]
	pub fn cancel_requested(&self) -> bool {
		matches!(
			self.shared.box_.unfenced_state(),
			State::Cancelling | State::Cancelled
		)
	}

	/// Registers `handler` to run on `context` if cancellation is requested
	/// while the promise is still pending.
	///
	/// If cancellation was already requested the handler runs right away; if
	/// the promise already settled it is dropped unrun.
	pub fn on_request_cancel(
		&self,
		context: Arc<dyn Context>,
		handler: impl FnOnce(Resolver<T, E>) + Send + 'static,
	) {
		Shared::push_cancel_handler(
			&self.shared,
			Box::new(move |resolver| {
				context.execute(Box::new(move || handler(resolver)));
			}),
		);
	}
}

impl<T: Send + 'static, E: Send + 'static> Clone for Resolver<T, E> {
	fn clone(&self) -> Self {
		Self::retained(&self.shared)
	}
}

impl<T: Send + 'static, E: Send + 'static> Drop for Resolver<T, E> {
	fn drop(&mut self) {
		if self.shared.resolvers.fetch_sub(1, Ordering::Relaxed) == 1 {
			// The last resolver vanished without settling. The transition
			// table makes this a no-op on a settled or resolving box.
			Shared::cancel(&self.shared);
		}
	}
}

impl<T: Send + 'static, E: Send + 'static> Debug for Resolver<T, E> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Resolver")
			.field("state", &self.shared.box_.unfenced_state())
			.finish()
	}
}
