use std::{
	ptr,
	sync::{
		atomic::{AtomicBool, Ordering::Relaxed},
		Arc,
	},
	thread,
};

use overmorrow::token::{TokenBox, TokenHead};

struct Node {
	next: TokenHead<Node>,
	id: usize,
}

struct ChildRecord {
	next: *mut ChildRecord,
	id: usize,
}

type Box_ = TokenBox<Node, ChildRecord>;

fn push(box_: &Box_, id: usize) -> *mut Node {
	let node = Box::into_raw(Box::new(Node {
		next: TokenHead::Generation(0),
		id,
	}));
	box_.push(node, |head| unsafe { (*node).next = head });
	node
}

/// Walks a returned chain to its tagged tail, releasing every node.
fn drain(head: TokenHead<Node>) -> (Vec<usize>, usize) {
	let mut ids = Vec::new();
	let mut cursor = head;
	loop {
		match cursor {
			TokenHead::Generation(generation) => return (ids, generation),
			TokenHead::Node(node) => {
				let node = unsafe { Box::from_raw(node) };
				ids.push(node.id);
				cursor = node.next;
			}
		}
	}
}

#[test]
fn a_fresh_box_is_at_generation_zero() {
	let box_ = Box_::new();
	assert_eq!(box_.head(), TokenHead::Generation(0));
}

#[test]
fn reset_returns_the_chain_and_installs_the_new_generation() {
	let box_ = Box_::new();
	let n1 = push(&box_, 1);
	let n2 = push(&box_, 2);
	assert_eq!(box_.head(), TokenHead::Node(n2));

	let prior = box_.reset(|_| 1);
	assert_eq!(prior, TokenHead::Node(n2));
	assert_eq!(box_.head(), TokenHead::Generation(1));

	let (ids, tail_generation) = drain(prior);
	assert_eq!(ids, [2, 1]);
	assert_eq!(tail_generation, 0);
	let _ = n1;
}

#[test]
fn resetting_an_empty_box_just_advances_the_generation() {
	let box_ = Box_::new();
	assert_eq!(
		box_.reset(|head| match head {
			TokenHead::Generation(generation) => generation + 1,
			TokenHead::Node(_) => unreachable!(),
		}),
		TokenHead::Generation(0),
	);
	assert_eq!(box_.head(), TokenHead::Generation(1));
}

#[test]
fn every_pushed_node_survives_concurrent_resets_intact() {
	const THREADS: usize = 4;
	const PER_THREAD: usize = 250;

	let box_ = Arc::new(Box_::new());
	let done = Arc::new(AtomicBool::new(false));

	let pushers = (0..THREADS)
		.map(|t| {
			let box_ = Arc::clone(&box_);
			thread::spawn(move || {
				for id in t * PER_THREAD..(t + 1) * PER_THREAD {
					push(&box_, id);
				}
			})
		})
		.collect::<Vec<_>>();

	// A single resetter may free chains while pushes continue; pushers never
	// read nodes, so the walk below is safe.
	let resetter = {
		let box_ = Arc::clone(&box_);
		let done = Arc::clone(&done);
		thread::spawn(move || {
			let mut generation = 0;
			let mut ids = Vec::new();
			loop {
				let finished = done.load(Relaxed);
				generation += 1;
				ids.extend(drain(box_.reset(|_| generation)).0);
				if finished {
					return ids;
				}
			}
		})
	};

	for pusher in pushers {
		pusher.join().unwrap();
	}
	done.store(true, Relaxed);
	let mut ids = resetter.join().unwrap();

	ids.sort_unstable();
	assert_eq!(ids, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
}

#[test]
fn child_records_chain_in_push_order() {
	let box_ = Box_::new();
	assert!(box_.children().is_null());

	for id in [1, 2] {
		let child = Box::into_raw(Box::new(ChildRecord {
			next: ptr::null_mut(),
			id,
		}));
		box_.push_child(child, |head| unsafe { (*child).next = head });
	}

	let mut ids = Vec::new();
	let mut cursor = box_.children();
	while !cursor.is_null() {
		let record = unsafe { Box::from_raw(cursor) };
		ids.push(record.id);
		cursor = record.next;
	}
	assert_eq!(ids, [2, 1]);
}
