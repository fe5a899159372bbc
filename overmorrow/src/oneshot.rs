//! A single-fire guard around an owned callback.

use core::{
	cell::UnsafeCell,
	fmt::{self, Debug, Formatter},
	sync::atomic::{AtomicBool, Ordering},
};

/// An owned callback that runs at most once, no matter how many threads race
/// to [`invoke`](`OneshotBlock::invoke`) it.
///
/// The winning invocation takes the callback out and releases its storage;
/// every later invocation is a no-op. A block dropped without ever being
/// invoked releases the callback without running it.
pub struct OneshotBlock<F> {
	invoked: AtomicBool,
	callback: UnsafeCell<Option<F>>,
}

// The callback slot is only touched by the single thread that wins the
// `invoked` swap, or by `drop` once the block is no longer shared.
unsafe impl<F: Send> Sync for OneshotBlock<F> {}

impl<F: FnOnce()> OneshotBlock<F> {
	/// Wraps `callback` in a fresh, unfired block.
	#[must_use]
	pub const fn new(callback: F) -> Self {
		Self {
			invoked: AtomicBool::new(false),
			callback: UnsafeCell::new(Some(callback)),
		}
	}

	/// Runs the callback iff no invocation beat this one to it.
	///
	/// The test-and-set is `Relaxed`: the callback was written before the
	/// block was shared, so whatever synchronisation shared it also
	/// published the closure. Losing invocations return without blocking.
	pub fn invoke(&self) {
		if !self.invoked.swap(true, Ordering::Relaxed) {
			let callback =
				unsafe { &mut *self.callback.get() }.take().expect("unreachable");
			callback();
		}
	}
}

impl<F> Debug for OneshotBlock<F> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("OneshotBlock")
			.field("invoked", &self.invoked.load(Ordering::Relaxed))
			.finish()
	}
}
