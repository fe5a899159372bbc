#![warn(clippy::pedantic)]

mod context;
pub use context::{Background, Context, Immediate, Job};

mod delayed;
pub use delayed::DelayedPromise;

mod operation;
pub use operation::{Operation, OperationState, Phase, PhaseEvent, PromiseOperation};

mod promise;
pub use promise::{Promise, PromiseResult, Resolver};

mod token;
pub use token::InvalidationToken;

pub use overmorrow::promise_box::State;
