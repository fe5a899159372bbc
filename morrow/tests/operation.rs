use std::sync::{
	atomic::{AtomicBool, Ordering::Relaxed},
	Arc, Mutex,
};

use morrow::{
	Immediate, Operation, OperationState, Phase, PhaseEvent, Promise, PromiseOperation,
	PromiseResult, Resolver, State,
};

struct NoopOperation {
	state: OperationState,
}

impl Operation for NoopOperation {
	fn lifecycle(&self) -> &OperationState {
		&self.state
	}
}

#[test]
fn the_base_operation_finishes_with_bracketed_notifications() {
	let events = Arc::new(Mutex::new(Vec::new()));
	let operation = NoopOperation {
		state: OperationState::new(),
	};
	operation.state.set_observer({
		let events = Arc::clone(&events);
		move |event| events.lock().unwrap().push(event)
	});

	assert!(operation.is_ready());
	assert!(!operation.is_executing());
	operation.start();

	assert!(operation.is_finished());
	assert_eq!(
		events.lock().unwrap().drain(..).collect::<Vec<_>>(),
		[
			PhaseEvent::WillSet(Phase::Executing),
			PhaseEvent::DidSet(Phase::Executing),
			PhaseEvent::WillSet(Phase::Finished),
			PhaseEvent::DidSet(Phase::Finished),
		],
	);

	// Starting again is a no-op.
	operation.start();
	assert!(events.lock().unwrap().is_empty());
}

fn observed(promise: &Promise<u32, &'static str>) -> Arc<Mutex<Vec<PromiseResult<u32, &'static str>>>> {
	let seen = Arc::new(Mutex::new(Vec::new()));
	promise.observe(Arc::new(Immediate), {
		let seen = Arc::clone(&seen);
		move |result| seen.lock().unwrap().push(result)
	});
	seen
}

#[test]
fn a_started_operation_delivers_its_handler_result() {
	let operation = PromiseOperation::<u32, &str>::new(Arc::new(Immediate), |resolver| {
		assert!(resolver.fulfill(5));
	});
	let promise = operation.promise();
	let seen = observed(&promise);

	assert_eq!(promise.state(), State::Empty);
	operation.start();

	assert_eq!(*seen.lock().unwrap(), [PromiseResult::Fulfilled(5)]);
	assert!(operation.is_finished());
}

#[test]
fn dropping_an_unstarted_operation_cancels_its_promise() {
	let ran = Arc::new(AtomicBool::new(false));
	let operation = PromiseOperation::<u32, &str>::new(Arc::new(Immediate), {
		let ran = Arc::clone(&ran);
		move |_resolver| {
			ran.store(true, Relaxed);
		}
	});
	let promise = operation.promise();
	let seen = observed(&promise);

	drop(operation);

	assert!(!ran.load(Relaxed));
	assert_eq!(promise.state(), State::Cancelled);
	assert_eq!(*seen.lock().unwrap(), [PromiseResult::Cancelled]);
}

#[test]
fn cancelling_before_start_reaches_the_handler_cooperatively() {
	let ran = Arc::new(AtomicBool::new(false));
	let operation = PromiseOperation::<u32, &str>::new(Arc::new(Immediate), {
		let ran = Arc::clone(&ran);
		move |resolver| {
			ran.store(true, Relaxed);
			// The pre-start cancellation arrives through the resolver by the
			// time the handler runs.
			assert!(resolver.cancel_requested());
			assert!(resolver.cancel());
		}
	});
	let promise = operation.promise();
	let seen = observed(&promise);

	operation.cancel();
	assert!(operation.is_cancelled());
	assert!(!ran.load(Relaxed));

	operation.start();

	assert!(ran.load(Relaxed));
	assert_eq!(promise.state(), State::Cancelled);
	assert_eq!(*seen.lock().unwrap(), [PromiseResult::Cancelled]);
	assert!(operation.is_finished());
}

#[test]
fn a_promise_side_cancel_request_cancels_the_operation() {
	let operation = PromiseOperation::<u32, &str>::new(Arc::new(Immediate), |resolver| {
		if resolver.cancel_requested() {
			assert!(resolver.cancel());
		} else {
			assert!(resolver.fulfill(1));
		}
	});
	let promise = operation.promise();

	promise.request_cancel();
	assert!(operation.is_cancelled());

	operation.start();
	assert_eq!(promise.state(), State::Cancelled);
}

#[test]
fn cancellation_after_start_is_cooperative() {
	let parked: Arc<Mutex<Option<Resolver<u32, &str>>>> = Arc::new(Mutex::new(None));
	let operation = PromiseOperation::new(Arc::new(Immediate), {
		let parked = Arc::clone(&parked);
		move |resolver| {
			*parked.lock().unwrap() = Some(resolver);
		}
	});
	let promise = operation.promise();
	let seen = observed(&promise);

	operation.start();
	assert!(operation.is_executing());

	promise.request_cancel();
	let resolver = parked.lock().unwrap().take().unwrap();
	assert!(resolver.cancel_requested());
	assert!(resolver.cancel());

	assert_eq!(*seen.lock().unwrap(), [PromiseResult::Cancelled]);
	assert!(operation.is_finished());
}
