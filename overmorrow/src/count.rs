//! The flagged observer counter carried by every promise box.
//!
//! One 64-bit word: the low 62 bits count outstanding observers, bit 62 is
//! the "unobserved" flag (never incremented so far) and bit 63 is the
//! "unsealed" flag (new observers may still appear). Both flags start set.
//!
//! All accesses are `Relaxed`; ordering needs around the counter are carried
//! by the state transitions that accompany it.

use core::sync::atomic::{AtomicU64, Ordering};

const COUNT_MASK: u64 = !(3 << 62);
const UNOBSERVED: u64 = 1 << 62;
const UNSEALED: u64 = 1 << 63;

/// A 62-bit observer count with "unobserved" and "unsealed" flag bits.
///
/// Exactly one of [`decrement`](`ObserverCount::decrement`) and
/// [`seal`](`ObserverCount::seal`) returns `true` over a counter's lifetime;
/// the owner uses that signal to run its final release actions.
#[derive(Debug)]
pub struct ObserverCount(AtomicU64);

impl ObserverCount {
	/// Creates a counter at zero with both flags set.
	#[must_use]
	pub const fn new() -> Self {
		Self(AtomicU64::new(UNSEALED | UNOBSERVED))
	}

	/// Adds an observer, clearing the unobserved flag.
	///
	/// The unobserved flag never comes back; the sealed bit is untouched.
	/// There is no overflow guard beyond the 62-bit domain.
	pub fn increment(&self) {
		let mut current = self.0.load(Ordering::Relaxed);
		loop {
			let next = (current & !UNOBSERVED) + 1;
			match self
				.0
				.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
			{
				Ok(_) => return,
				Err(observed) => current = observed,
			}
		}
	}

	/// Removes an observer.
	///
	/// Returns `true` iff this was the last observer *and* the counter was
	/// already sealed — that is, iff the prior word was exactly `1`.
	///
	/// # Panics
	///
	/// Panics if the count underflows. That is a caller bug: every decrement
	/// **must** pair with an earlier increment.
	#[must_use]
	pub fn decrement(&self) -> bool {
		let prior = self.0.fetch_sub(1, Ordering::Relaxed);
		assert!(prior & COUNT_MASK != 0, "observer count underflow");
		prior == 1
	}

	/// Clears the unsealed flag: no further observers are expected.
	///
	/// Returns `true` iff the word is exactly zero afterwards (sealed, no
	/// outstanding observers, and observed at least once). Sealing an
	/// already-sealed counter returns `false`.
	#[must_use]
	pub fn seal(&self) -> bool {
		let mut current = self.0.load(Ordering::Relaxed);
		loop {
			if current & UNSEALED == 0 {
				return false;
			}
			let next = current & !UNSEALED;
			match self
				.0
				.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
			{
				Ok(_) => return next == 0,
				Err(observed) => current = observed,
			}
		}
	}

	/// Whether no observer was ever added.
	#[must_use]
	pub fn is_unobserved(&self) -> bool {
		self.0.load(Ordering::Relaxed) & UNOBSERVED != 0
	}

	/// Whether the counter still accepts observers.
	#[must_use]
	pub fn is_unsealed(&self) -> bool {
		self.0.load(Ordering::Relaxed) & UNSEALED != 0
	}

	/// The outstanding observer count, without the flag bits.
	#[must_use]
	pub fn count(&self) -> u64 {
		self.0.load(Ordering::Relaxed) & COUNT_MASK
	}
}

impl Default for ObserverCount {
	fn default() -> Self {
		Self::new()
	}
}
