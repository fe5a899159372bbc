//! The atomic state machine at the heart of every promise, composed with its
//! two callback stacks and its observer counter.
//!
//! A box moves through six states:
//!
//! ```text
//! Delayed ─→ Empty ─→ Resolving ─→ Resolved
//!              │          ↑
//!              ├─→ Cancelling ─→ Cancelled
//!              └────────────────────↗
//! ```
//!
//! `Resolved` and `Cancelled` are terminal. Every other edge — including
//! every self-transition — is rejected.

use core::sync::atomic::{fence, AtomicU8, Ordering};

use crate::{count::ObserverCount, stack::AtomicStack};

/// The lifecycle state of a [`PromiseBox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
	/// Pre-armed: a resolver callback is stored but not yet dispatched.
	/// Cancellation requests are ignored until the box is realised.
	Delayed,
	/// Live and unresolved; no work has claimed the box yet.
	Empty,
	/// A resolver has claimed the box and is writing its value.
	Resolving,
	/// Terminal: the value is published.
	Resolved,
	/// Cancellation was requested; a resolver may still override it.
	Cancelling,
	/// Terminal: the box settled without a value.
	Cancelled,
}

impl State {
	/// Whether this state ends the box's lifecycle.
	#[must_use]
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Resolved | Self::Cancelled)
	}

	fn may_become(self, target: Self) -> bool {
		match (self, target) {
			(Self::Delayed, Self::Empty)
			| (Self::Empty, Self::Resolving | Self::Cancelling | Self::Cancelled)
			| (Self::Resolving, Self::Resolved)
			| (Self::Cancelling, Self::Resolving | Self::Cancelled) => true,
			_ => false,
		}
	}

	fn from_bits(bits: u8) -> Self {
		match bits {
			0 => Self::Delayed,
			1 => Self::Empty,
			2 => Self::Resolving,
			3 => Self::Resolved,
			4 => Self::Cancelling,
			5 => Self::Cancelled,
			_ => unreachable!("corrupt state word"),
		}
	}
}

/// One promise's shared machinery: the state word, the observer callback
/// stack, the cancel-request stack and the observer counter.
///
/// `C` and `R` are the caller's node types for the two stacks; the box never
/// dereferences either.
///
/// # Logic
///
/// The owner that drives the box into a terminal state **must** close and
/// drain both stacks exactly once.
#[derive(Debug)]
pub struct PromiseBox<C, R> {
	state: AtomicU8,
	callbacks: AtomicStack<C>,
	request_cancel: AtomicStack<R>,
	observers: ObserverCount,
}

impl<C, R> PromiseBox<C, R> {
	/// Creates a box in `initial` state.
	///
	/// # Panics
	///
	/// Panics unless `initial` is [`State::Delayed`] or [`State::Empty`];
	/// every other state is only reachable through
	/// [`transition`](`PromiseBox::transition`).
	#[must_use]
	pub const fn new(initial: State) -> Self {
		assert!(
			matches!(initial, State::Delayed | State::Empty),
			"boxes start Delayed or Empty"
		);
		Self {
			state: AtomicU8::new(initial as u8),
			callbacks: AtomicStack::new(),
			request_cancel: AtomicStack::new(),
			observers: ObserverCount::new(),
		}
	}

	/// Attempts to move the box into `target`.
	///
	/// Returns `true` iff the compare-and-swap committed `target` from a
	/// state the transition table allows. A `false` usually means another
	/// thread won a race and **should** be handled by doing nothing.
	///
	/// The successful store is `Release` when `target` is
	/// [`State::Resolved`] — pairing with the `Acquire` fence in
	/// [`state`](`PromiseBox::state`) to publish the resolver's writes — and
	/// `Relaxed` otherwise.
	pub fn transition(&self, target: State) -> bool {
		let success = if target == State::Resolved {
			Ordering::Release
		} else {
			Ordering::Relaxed
		};
		let mut current = self.state.load(Ordering::Relaxed);
		loop {
			if !State::from_bits(current).may_become(target) {
				return false;
			}
			match self.state.compare_exchange_weak(
				current,
				target as u8,
				success,
				Ordering::Relaxed,
			) {
				Ok(_) => return true,
				Err(observed) => current = observed,
			}
		}
	}

	/// Reads the state, fencing for value visibility.
	///
	/// If the observed state is [`State::Resolved`] this issues an `Acquire`
	/// fence first, so everything the resolver wrote before its `Release`
	/// transition is visible to the caller.
	#[must_use]
	pub fn state(&self) -> State {
		let state = State::from_bits(self.state.load(Ordering::Relaxed));
		if state == State::Resolved {
			fence(Ordering::Acquire);
		}
		state
	}

	/// Reads the bare state tag without fencing.
	///
	/// Cheaper than [`state`](`PromiseBox::state`), but the caller **must
	/// not** use it to justify reading a published value.
	#[must_use]
	pub fn unfenced_state(&self) -> State {
		State::from_bits(self.state.load(Ordering::Relaxed))
	}

	/// The observer callback stack.
	#[must_use]
	pub fn callbacks(&self) -> &AtomicStack<C> {
		&self.callbacks
	}

	/// The cancel-request callback stack.
	#[must_use]
	pub fn request_cancel(&self) -> &AtomicStack<R> {
		&self.request_cancel
	}

	/// The observer counter.
	#[must_use]
	pub fn observers(&self) -> &ObserverCount {
		&self.observers
	}
}
