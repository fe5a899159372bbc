use std::sync::Arc;

use futures_lite::future::block_on;
use morrow::{Background, Immediate, Promise, PromiseResult};

#[test]
fn a_settled_promise_future_is_ready() {
	let (promise, resolver) = Promise::<u32, &str>::with_resolver();
	assert!(resolver.fulfill(3));
	assert_eq!(
		block_on(promise.into_future()),
		PromiseResult::Fulfilled(3)
	);
}

#[test]
fn the_future_waits_for_a_background_resolution() {
	let promise: Promise<u32, &str> = Promise::run(&Background, |resolver| {
		assert!(resolver.fulfill(4));
	});
	assert_eq!(
		block_on(promise.into_future()),
		PromiseResult::Fulfilled(4)
	);
}

#[test]
fn dropping_the_resolver_cancels_the_future() {
	let (promise, resolver) = Promise::<u32, &str>::with_resolver();
	let future = promise.into_future();
	drop(resolver);
	assert_eq!(block_on(future), PromiseResult::Cancelled);
}

#[test]
fn a_rejection_surfaces_through_the_future() {
	let (promise, resolver) = Promise::<u32, &str>::with_resolver();
	let future = promise.into_future();
	assert!(resolver.reject("boom"));
	assert_eq!(block_on(future), PromiseResult::Rejected("boom"));
}

#[test]
fn immediate_promises_compose_with_futures() {
	let promise: Promise<u32, &str> = Promise::run(&Immediate, |resolver| {
		assert!(resolver.fulfill(10));
	});
	let doubled = block_on(async move {
		match promise.into_future().await {
			PromiseResult::Fulfilled(value) => value * 2,
			_ => 0,
		}
	});
	assert_eq!(doubled, 20);
}
