//! Shardable-axes model and the axis identity registry.
//!
//! A [`ShardableAxis`] names one partitionable dimension of a tensor value.
//! Structural equality is useless here: two axes can share a name and a
//! position while being semantically distinct (a broadcasted axis next to a
//! native one), and one logical axis travels through many positions as ops
//! permute or drop dimensions. Identity therefore lives in [`AxisId`],
//! allocated once per logical axis by an [`AxisRegistry`] and threaded
//! unchanged through every op that preserves the axis.

use ktc_intern::Symbol;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque, process-wide-unique identity for one logical tensor axis.
///
/// Ids are strictly increasing in allocation order and are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisId(u64);

impl AxisId {
    /// Returns the raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Allocator of fresh [`AxisId`]s.
///
/// The registry is the only shared mutable state in fusion classification.
/// Create one per session and hand `&AxisRegistry` (or an `Arc`) to every
/// classification worker; allocation is a single relaxed atomic increment,
/// safe under any amount of concurrency. Counter wrap-around is accepted
/// as unreachable for realistic graph sizes.
#[derive(Debug, Default)]
pub struct AxisRegistry {
    next: AtomicU64,
}

impl AxisRegistry {
    /// Creates a registry whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh id, strictly greater than every id returned before.
    pub fn next_id(&self) -> AxisId {
        AxisId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// One partitionable dimension of a tensor value.
///
/// Equality and hashing consider only [`ShardableAxis::id`]: the name is a
/// human-readable label and the position is context (where the axis sits in
/// one particular value), neither of which makes two axes interchangeable
/// for sharding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ShardableAxis {
    /// Position of this axis within its tensor value.
    pub axis: usize,
    /// Human-readable axis label.
    pub axis_name: Symbol,
    /// The axis identity.
    pub id: AxisId,
}

impl ShardableAxis {
    /// Mints a new axis at `axis` with a fresh identity.
    #[must_use]
    pub fn fresh(axis: usize, axis_name: Symbol, registry: &AxisRegistry) -> Self {
        Self {
            axis,
            axis_name,
            id: registry.next_id(),
        }
    }

    /// The same logical axis observed at a different position.
    #[must_use]
    pub const fn at_position(self, axis: usize) -> Self {
        Self {
            axis,
            axis_name: self.axis_name,
            id: self.id,
        }
    }
}

impl PartialEq for ShardableAxis {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ShardableAxis {}

impl Hash for ShardableAxis {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// The ordered shardable axes of one tensor value, in dimension order.
///
/// Positional pairwise comparison is only meaningful between two lists
/// describing values of the same rank.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardableAxes(SmallVec<[ShardableAxis; 4]>);

impl ShardableAxes {
    /// Creates a list from axes already carrying their positions.
    #[must_use]
    pub fn new(axes: impl IntoIterator<Item = ShardableAxis>) -> Self {
        Self(axes.into_iter().collect())
    }

    /// Creates a rank-`names.len()` list of entirely fresh axes.
    #[must_use]
    pub fn fresh(names: &[Symbol], registry: &AxisRegistry) -> Self {
        Self(
            names
                .iter()
                .enumerate()
                .map(|(axis, &axis_name)| ShardableAxis::fresh(axis, axis_name, registry))
                .collect(),
        )
    }

    /// Returns the rank this list describes.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Returns the axes in dimension order.
    #[must_use]
    pub fn axes(&self) -> &[ShardableAxis] {
        &self.0
    }

    /// Returns the axis at `position`, if within rank.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&ShardableAxis> {
        self.0.get(position)
    }

    /// Iterates over the axes in dimension order.
    pub fn iter(&self) -> impl Iterator<Item = &ShardableAxis> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_strictly_increase() {
        let registry = AxisRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        let c = registry.next_id();
        assert!(a < b && b < c);
        assert_eq!(a.get(), 1);
    }

    #[test]
    fn test_axis_equality_is_identity_only() {
        let registry = AxisRegistry::new();
        let name = Symbol::intern("batch");
        let a = ShardableAxis::fresh(0, name, &registry);
        let b = ShardableAxis::fresh(0, name, &registry);
        // Same name, same position, different identity.
        assert_ne!(a, b);
        // Same identity at a different position and name is still the axis.
        let moved = ShardableAxis {
            axis_name: Symbol::intern("renamed"),
            ..a.at_position(3)
        };
        assert_eq!(a, moved);
    }

    #[test]
    fn test_fresh_axes_carry_positions_and_names() {
        let registry = AxisRegistry::new();
        let names = [Symbol::intern("m"), Symbol::intern("n")];
        let axes = ShardableAxes::fresh(&names, &registry);
        assert_eq!(axes.rank(), 2);
        assert_eq!(axes.get(1).unwrap().axis, 1);
        assert_eq!(axes.get(1).unwrap().axis_name.as_str(), "n");
        assert_ne!(axes.get(0).unwrap().id, axes.get(1).unwrap().id);
    }
}
