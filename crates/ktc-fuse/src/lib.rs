//! # KTC Fusion Pattern Classification
//!
//! This crate classifies connected subgraphs ("groups") of a tensor
//! computation graph into a closed set of canonical fusion-pattern
//! categories, ahead of kernel-fusion code generation. Each classified
//! group carries the structural and axis-mapping metadata the code
//! generator needs to decide how the group's operations may fuse into a
//! single kernel.
//!
//! ## Pipeline Position
//!
//! ```text
//! [Op Graph]           <- ktc-graph: opaque query surface
//!     |
//!     | candidate groups (from the graph-partitioning pass)
//!     v
//! [Classification]     <- this crate: one GroupPattern per group
//!     |
//!     v
//! [Kernel Planning]    <- consumes patterns; decides fusion legality,
//!                         binds axis correlation for parallel tiling
//! ```
//!
//! ## How classification works
//!
//! For every member of a group, the classifier derives a
//! [`ShardableAxesSignature`]: the shardable axes of the op's output and
//! of each consumed input. Ops that preserve an axis thread its
//! [`AxisId`] through unchanged; ops that sever correspondence mint fresh
//! ids from the shared [`AxisRegistry`]. Classification then walks a
//! fixed decision order (error, single reduction, injective chain,
//! reduction composite, partial-shardable fallback) and returns exactly
//! one [`GroupPattern`].
//!
//! Classification is total (errors are a pattern variant, not a panic),
//! deterministic for a given group structure, and safe to run from many
//! workers in parallel — the registry's atomic counter is the only shared
//! mutable state.
//!
//! ## Main Types
//!
//! - [`GroupPattern`]: the classification result
//! - [`Classifier`] / [`classify_group`]: entry points
//! - [`ShardableAxesSignature`]: per-op axis-sharding record
//! - [`ShardableAxes`] / [`ShardableAxis`]: the axes model
//! - [`AxisRegistry`] / [`AxisId`]: axis identity allocation
//!
//! ## See Also
//!
//! - `ktc-graph`: the operation-graph query surface this crate consumes

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod axes;
pub mod classify;
pub mod pattern;
pub mod signature;

pub use axes::{AxisId, AxisRegistry, ShardableAxes, ShardableAxis};
pub use classify::{classify_group, Classifier, ClassifyConfig};
pub use pattern::{
    ErrorPattern, GroupPattern, InjectiveSourcePattern, PartialShardablePattern, ReductionPattern,
    SingleReductionOpPattern,
};
pub use signature::{derive_signature, OpOperand, ShardableAxesSignature, SignatureError};
