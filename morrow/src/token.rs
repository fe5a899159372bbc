use std::{
	fmt::{self, Debug, Formatter},
	ptr,
	sync::Arc,
};

use overmorrow::token::{TokenBox, TokenHead};
use parking_lot::Mutex;
use scopeguard::guard;
use tap::Pipe;

use crate::promise::{Promise, Shared};

struct CallbackNode {
	next: TokenHead<CallbackNode>,
	generation: usize,
	action: Box<dyn FnOnce() + Send>,
}

struct ChildRecord {
	next: *mut ChildRecord,
	token: InvalidationToken,
}

struct Inner {
	box_: TokenBox<CallbackNode, ChildRecord>,
	// Serialises invalidations: the generation closure dereferences the
	// prior head node, and an unserialised racing reset could free it
	// mid-read. Registration stays lock-free.
	invalidating: Mutex<()>,
}

impl Drop for Inner {
	fn drop(&mut self) {
		// Exclusive access now: release everything without invoking it.
		let mut cursor = self.box_.head();
		while let TokenHead::Node(node) = cursor {
			cursor = unsafe { Box::from_raw(node) }.next;
		}
		let mut child = self.box_.children();
		while !child.is_null() {
			let record = unsafe { Box::from_raw(child) };
			child = record.next;
		}
	}
}

/// Detaches groups of pending callbacks in one move.
///
/// Callbacks wrapped through [`bound`](`InvalidationToken::bound`) remember
/// the token's generation; [`invalidate`](`InvalidationToken::invalidate`)
/// advances it, so every previously bound callback short-circuits from then
/// on. Actions registered directly run once, *during* invalidation — that is
/// how [`request_cancel_on_invalidate`](`InvalidationToken::request_cancel_on_invalidate`)
/// cancels in-flight promises.
///
/// Clones share one underlying box. Tokens can be chained; invalidating a
/// token also invalidates every token chained onto it. Chains **must** be
/// acyclic.
#[derive(Clone)]
pub struct InvalidationToken {
	inner: Arc<Inner>,
}

impl InvalidationToken {
	/// Creates a fresh token at generation zero.
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				box_: TokenBox::new(),
				invalidating: Mutex::new(()),
			}),
		}
	}

	/// The token's current generation.
	#[must_use]
	pub fn generation(&self) -> usize {
		match self.inner.box_.head() {
			TokenHead::Generation(generation) => generation,
			TokenHead::Node(_) => {
				// Rare path: pin the chain against a concurrent invalidation
				// before reading the head node's stamp.
				let _guard = self.inner.invalidating.lock();
				match self.inner.box_.head() {
					TokenHead::Generation(generation) => generation,
					TokenHead::Node(node) => unsafe { (*node).generation },
				}
			}
		}
	}

	/// Registers `action` to run once when this token is invalidated.
	///
	/// Dropping the last token handle releases unfired actions without
	/// running them.
	pub fn register(&self, action: impl FnOnce() + Send + 'static) {
		// A registration racing an invalidation may stamp the outgoing
		// generation; such an action still runs at the *next* invalidation,
		// which is all a racing registration may assume anyway.
		let node = Box::new(CallbackNode {
			next: TokenHead::Generation(0),
			generation: self.generation(),
			action: Box::new(action),
		})
		.pipe(Box::into_raw);
		self.inner.box_.push(node, |head| unsafe { (*node).next = head });
	}

	/// Advances the generation, runs every registered action exactly once,
	/// and invalidates chained tokens.
	pub fn invalidate(&self) {
		let prior = {
			let _guard = self.inner.invalidating.lock();
			self.inner.box_.reset(|head| match head {
				TokenHead::Generation(generation) => generation + 1,
				// The lock serialises resets, so the prior head can't be
				// freed out from under this read.
				TokenHead::Node(node) => (unsafe { (*node).generation }) + 1,
			})
		};
		// The drained chain is unreachable from the new head, so it can be
		// walked (and its actions run) without holding the lock.
		if let TokenHead::Node(head) = prior {
			// Release the rest of the chain even if an action panics.
			let mut cursor = guard(TokenHead::Node(head), |mut cursor| {
				while let TokenHead::Node(node) = cursor {
					cursor = unsafe { Box::from_raw(node) }.next;
				}
			});
			while let TokenHead::Node(node) = *cursor {
				let node = unsafe { Box::from_raw(node) };
				*cursor = node.next;
				(node.action)();
			}
		}
		let mut child = self.inner.box_.children();
		while !child.is_null() {
			let record = unsafe { &*child };
			record.token.invalidate();
			child = record.next;
		}
	}

	/// Chains `child` onto this token: invalidating `self` also invalidates
	/// `child` (but not the other way around). Chains are permanent for the
	/// life of this token and **must** stay acyclic.
	pub fn chain_token(&self, child: &InvalidationToken) {
		let record = Box::new(ChildRecord {
			next: ptr::null_mut(),
			token: child.clone(),
		})
		.pipe(Box::into_raw);
		self.inner
			.box_
			.push_child(record, |head| unsafe { (*record).next = head });
	}

	/// Wraps `callback` so it runs only while this token's generation still
	/// matches the one captured here.
	pub fn bound<A>(
		&self,
		callback: impl FnOnce(A) + Send + 'static,
	) -> impl FnOnce(A) + Send + 'static {
		let token = self.clone();
		let generation = self.generation();
		move |argument| {
			if token.generation() == generation {
				callback(argument);
			}
		}
	}

	/// Requests cancellation of `promise` when this token is invalidated.
	///
	/// Holds the promise weakly: a promise that settled or went away before
	/// the invalidation is left alone.
	pub fn request_cancel_on_invalidate<T: Send + 'static, E: Send + 'static>(
		&self,
		promise: &Promise<T, E>,
	) {
		let weak = Arc::downgrade(&promise.shared);
		self.register(move || {
			if let Some(shared) = weak.upgrade() {
				Shared::request_cancel(&shared);
			}
		});
	}
}

impl Default for InvalidationToken {
	fn default() -> Self {
		Self::new()
	}
}

impl Debug for InvalidationToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("InvalidationToken")
			.field("generation", &self.generation())
			.finish()
	}
}
