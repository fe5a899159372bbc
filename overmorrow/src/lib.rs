#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]
//!
//! # Threading Notes
//!
//! Every operation in this crate is a single atomic instruction or a
//! compare-and-swap loop. Nothing blocks the calling thread, and closures
//! passed into list operations **may** run more than once under contention.

pub mod count;
pub mod oneshot;
pub mod promise_box;
pub mod stack;
pub mod token;

#[doc = include_str!("../README.md")]
mod readme {}
