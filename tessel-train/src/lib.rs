//! Training schedulers for Tessel pipelines.
//!
//! A [`Pipeline`] is an [`Input`] followed by weighted [`Layer`]s. [`Direct`] steps it on one
//! thread, [`Threaded`] on many threads sharing parameters, and [`Distributed`] on every node of
//! a cluster, each node training on the column chunks it is home to.

pub use descent::*;
pub use input::*;
pub use layer::*;
pub use params::*;
pub use pipeline::*;
pub use rendezvous::*;
pub use trainer::*;

mod descent;
mod input;
mod layer;
mod params;
mod pipeline;
mod rendezvous;
mod trainer;
