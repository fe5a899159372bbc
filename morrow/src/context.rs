use std::{
	cell::{Cell, RefCell},
	collections::VecDeque,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{mpsc, OnceLock},
	thread,
};

use parking_lot::Mutex;
use scopeguard::guard;

/// A unit of work as the contexts carry it.
pub type Job = Box<dyn FnOnce() + Send>;

/// Somewhere callbacks can run: a thread, a queue, or right here.
///
/// # Logic
///
/// The promise machinery calls [`execute`](`Context::execute`) at most once
/// per delayed-promise realisation and once per dispatched observer; a
/// context **must** eventually run every job it accepted.
pub trait Context: Send + Sync {
	/// Runs `job` on this context.
	fn execute(&self, job: Job);
}

thread_local! {
	static DISPATCHING: Cell<bool> = const { Cell::new(false) };
	static QUEUE: RefCell<VecDeque<Job>> = const { RefCell::new(VecDeque::new()) };
}

/// Runs jobs synchronously on the calling thread.
///
/// Jobs submitted *from within* a running job are queued into a thread-local
/// FIFO and run after the current job returns, flattening what would
/// otherwise be unbounded recursion through observer chains.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Context for Immediate {
	fn execute(&self, job: Job) {
		if DISPATCHING.with(Cell::get) {
			QUEUE.with(|queue| queue.borrow_mut().push_back(job));
			return;
		}
		DISPATCHING.with(|flag| flag.set(true));
		// Jobs a panicking job left queued run at this thread's next
		// immediate dispatch.
		let _reset = guard((), |()| DISPATCHING.with(|flag| flag.set(false)));
		job();
		while let Some(next) = QUEUE.with(|queue| queue.borrow_mut().pop_front()) {
			next();
		}
	}
}

/// Runs jobs in submission order on a shared worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Background;

fn background_sender() -> &'static Mutex<mpsc::Sender<Job>> {
	static SENDER: OnceLock<Mutex<mpsc::Sender<Job>>> = OnceLock::new();
	SENDER.get_or_init(|| {
		let (sender, receiver) = mpsc::channel::<Job>();
		thread::Builder::new()
			.name("morrow-background".into())
			.spawn(move || {
				while let Ok(job) = receiver.recv() {
					// A panicking job must not take the worker down with it.
					let _ = catch_unwind(AssertUnwindSafe(job));
				}
			})
			.expect("failed to spawn the background worker");
		Mutex::new(sender)
	})
}

impl Context for Background {
	fn execute(&self, job: Job) {
		background_sender()
			.lock()
			.send(job)
			.expect("the background worker never exits");
	}
}
