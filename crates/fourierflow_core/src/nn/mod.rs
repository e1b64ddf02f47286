//! Dense building blocks with hand-written backward passes.
//!
//! Each layer's `forward` returns its output plus whatever the backward
//! pass needs; `backward` returns input gradients and, when given a
//! gradient accumulator of the layer's own type, adds parameter gradients
//! into it.

pub mod feed_forward;
pub mod group_norm;
pub mod linear;

pub use feed_forward::{FeedForward, FeedForwardCache};
pub use group_norm::{GroupNorm, GroupNormCache};
pub use linear::Linear;
