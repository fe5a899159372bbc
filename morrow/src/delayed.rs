use std::sync::Arc;

use overmorrow::promise_box::State;
use parking_lot::Mutex;

use crate::{
	context::Context,
	promise::{Promise, Resolver, Seal, Shared},
};

type StoredHandler<T, E> = (Arc<dyn Context>, Box<dyn FnOnce(Resolver<T, E>) + Send>);

/// A promise that holds its work back until somebody asks for it.
///
/// The underlying box starts `Delayed`: the handler and its context sit in
/// storage, and external cancellation requests bounce off the transition
/// table. The first call to [`promise`](`DelayedPromise::promise`) realises
/// the box — `Delayed → Empty` — and dispatches the handler exactly once;
/// every further call just returns another view of the same promise.
pub struct DelayedPromise<T: Send + 'static, E: Send + 'static> {
	pub(crate) shared: Arc<Shared<T, E>>,
	seal: Arc<Seal<T, E>>,
	stored: Mutex<Option<StoredHandler<T, E>>>,
}

impl<T: Send + 'static, E: Send + 'static> DelayedPromise<T, E> {
	/// Stores `handler` to be dispatched on `context` at first realisation.
	pub fn new(
		context: Arc<dyn Context>,
		handler: impl FnOnce(Resolver<T, E>) + Send + 'static,
	) -> Self {
		let shared = Shared::new(State::Delayed, 0);
		Self {
			seal: Arc::new(Seal {
				shared: Arc::clone(&shared),
			}),
			shared,
			stored: Mutex::new(Some((context, Box::new(handler)))),
		}
	}

	/// Realises the promise if this is the first ask, and returns a view.
	///
	/// All views returned here (and the delayed promise itself) share one
	/// seal, so the observer counter seals only once the last of them is
	/// gone.
	pub fn promise(&self) -> Promise<T, E> {
		self.realise();
		Promise {
			shared: Arc::clone(&self.shared),
			seal: Arc::clone(&self.seal),
		}
	}

	/// Realises the promise without constructing a view — for runners that
	/// already hold one.
	pub(crate) fn execute(&self) {
		self.realise();
	}

	fn realise(&self) {
		if self.shared.box_.transition(State::Empty) {
			let (context, handler) = self.stored.lock().take().expect("unreachable");
			let resolver = Resolver::retained(&self.shared);
			context.execute(Box::new(move || handler(resolver)));
		}
	}

	/// Realises and immediately cancels, discarding the stored handler
	/// without ever dispatching it.
	///
	/// A no-op if the box already advanced past `Delayed`: the first
	/// realisation's work stands.
	pub fn empty_and_cancel(&self) {
		if self.shared.box_.transition(State::Empty) {
			drop(self.stored.lock().take());
			Shared::cancel(&self.shared);
		}
	}
}

impl<T: Send + 'static, E: Send + 'static> std::fmt::Debug for DelayedPromise<T, E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DelayedPromise")
			.field("state", &self.shared.box_.unfenced_state())
			.finish()
	}
}
