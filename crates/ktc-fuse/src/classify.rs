//! Group classification.
//!
//! The classifier assigns one [`GroupPattern`] to a candidate group by a
//! fixed first-match-wins decision order:
//!
//! 1. error (empty, oversized, unknown member, disconnected, or a member
//!    whose signature cannot be derived),
//! 2. single reduction op,
//! 3. injective source (all members injective, no reduction),
//! 4. reduction composite (reductions plus injective surroundings),
//! 5. partial shardable (fallback, with the group's merged signature).
//!
//! Classification is a pure function of the group's structure and per-op
//! kinds: members are processed in ascending id order (topological by the
//! graph's construction invariant), so the same group always yields the
//! same variant with the same `ops` ordering. The only side effect is
//! axis-id allocation in the shared registry, which is why independent
//! groups classify safely in parallel.

use crate::axes::{AxisRegistry, ShardableAxes};
use crate::pattern::{
    ErrorPattern, GroupPattern, InjectiveSourcePattern, PartialShardablePattern, ReductionPattern,
    SingleReductionOpPattern,
};
use crate::signature::{derive_signature, ShardableAxesSignature};
use ktc_graph::{Group, OpGraph, OpId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

/// Policy knobs for classification.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassifyConfig {
    /// Maximum members a group may have (0 = unlimited). Oversized groups
    /// classify to an error pattern rather than being truncated.
    pub max_group_ops: usize,
}

/// Classifies candidate groups against one graph.
///
/// Holds only shared references; construction is free and a classifier
/// may be used from many workers at once.
#[derive(Clone, Copy, Debug)]
pub struct Classifier<'a> {
    graph: &'a OpGraph,
    registry: &'a AxisRegistry,
    config: ClassifyConfig,
}

impl<'a> Classifier<'a> {
    /// Creates a classifier with the default configuration.
    #[must_use]
    pub fn new(graph: &'a OpGraph, registry: &'a AxisRegistry) -> Self {
        Self::with_config(graph, registry, ClassifyConfig::default())
    }

    /// Creates a classifier with an explicit configuration.
    #[must_use]
    pub const fn with_config(
        graph: &'a OpGraph,
        registry: &'a AxisRegistry,
        config: ClassifyConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            config,
        }
    }

    /// Classifies one candidate group.
    ///
    /// Total: always returns a pattern, with all failures expressed as
    /// [`GroupPattern::Error`]. Never mutates the graph.
    #[must_use]
    pub fn classify(&self, group: &Group) -> GroupPattern {
        debug!(ops = group.len(), "classifying group");
        let pattern = self.classify_inner(group);
        trace!(variant = pattern.variant_name(), "group classified");
        pattern
    }

    fn classify_inner(&self, group: &Group) -> GroupPattern {
        // Step 1: well-formedness.
        if group.is_empty() {
            return error(None, "cannot classify an empty group".to_owned());
        }
        let members = group.members();
        if self.config.max_group_ops > 0 && members.len() > self.config.max_group_ops {
            return error(
                Some(members[0]),
                format!(
                    "group has {} operations, limit is {}",
                    members.len(),
                    self.config.max_group_ops
                ),
            );
        }
        for &op in members {
            if !self.graph.contains(op) {
                return error(Some(op), "operation is not in the graph".to_owned());
            }
        }
        if !group.is_connected(self.graph) {
            return error(
                Some(members[0]),
                "group is disconnected under its induced adjacency".to_owned(),
            );
        }

        // Derive every member's signature in topological order, threading
        // axis identities through the group. A boundary producer is minted
        // once so that two members consuming the same external value see
        // the same axes.
        let mut produced: FxHashMap<OpId, ShardableAxes> = FxHashMap::default();
        let mut boundary: FxHashMap<OpId, ShardableAxes> = FxHashMap::default();
        let mut signatures: Vec<(OpId, ShardableAxesSignature)> =
            Vec::with_capacity(members.len());
        for &op in members {
            let mut operand_axes = Vec::with_capacity(self.graph.operands(op).len());
            for &source in self.graph.operands(op) {
                let axes = if group.contains(source) {
                    produced
                        .get(&source)
                        .expect("members are topologically ordered")
                        .clone()
                } else {
                    boundary
                        .entry(source)
                        .or_insert_with(|| {
                            ShardableAxes::fresh(self.graph.axis_names(source), self.registry)
                        })
                        .clone()
                };
                operand_axes.push(axes);
            }
            match derive_signature(self.graph, op, &operand_axes, self.registry) {
                Ok(sig) => {
                    produced.insert(op, sig.output_shardable_axes.clone());
                    signatures.push((op, sig));
                }
                Err(err) => return error(Some(op), err.to_string()),
            }
        }

        // Steps 2-4: kind census.
        let reduction_count = members
            .iter()
            .filter(|&&op| self.graph.kind(op).is_reduction())
            .count();
        let all_injective = members.iter().all(|&op| self.graph.kind(op).is_injective());
        let injective_or_reduction = members
            .iter()
            .all(|&op| self.graph.kind(op).is_injective() || self.graph.kind(op).is_reduction());

        if members.len() == 1 && reduction_count == 1 {
            return GroupPattern::SingleReductionOp(SingleReductionOpPattern {
                reduce_op: members[0],
            });
        }
        if all_injective {
            return GroupPattern::InjectiveSource(InjectiveSourcePattern {
                ops: members.to_vec(),
            });
        }
        if reduction_count > 0 && injective_or_reduction {
            return GroupPattern::Reduction(ReductionPattern {
                ops: members.to_vec(),
            });
        }

        // Step 5: fallback with the merged group signature.
        GroupPattern::PartialShardable(PartialShardablePattern {
            ops: members.to_vec(),
            shardable_axes_signature: self.merge_signatures(group, &signatures),
        })
    }

    /// Merges per-member signatures into one record for the group: the
    /// designated output op's axes as output, and every boundary-crossing
    /// operand entry as input.
    fn merge_signatures(
        &self,
        group: &Group,
        signatures: &[(OpId, ShardableAxesSignature)],
    ) -> ShardableAxesSignature {
        let members = group.members();
        let consumed_internally: FxHashSet<OpId> = members
            .iter()
            .flat_map(|&op| self.graph.operands(op).iter().copied())
            .filter(|source| group.contains(*source))
            .collect();
        // Topologically last member nothing in the group consumes.
        let designated = members
            .iter()
            .rev()
            .copied()
            .find(|op| !consumed_internally.contains(op))
            .unwrap_or(*members.last().expect("group checked non-empty"));

        let output_shardable_axes = signatures
            .iter()
            .find(|(op, _)| *op == designated)
            .map(|(_, sig)| sig.output_shardable_axes.clone())
            .expect("every member has a derived signature");

        let input_shardable_axes = signatures
            .iter()
            .flat_map(|(op, sig)| {
                sig.input_shardable_axes.iter().filter_map(|(key, axes)| {
                    let source = self.graph.operands(*op)[key.index];
                    (!group.contains(source)).then(|| (*key, axes.clone()))
                })
            })
            .collect();

        ShardableAxesSignature {
            output_shardable_axes,
            input_shardable_axes,
        }
    }
}

/// Classifies `group` with a default-configured [`Classifier`].
#[must_use]
pub fn classify_group(graph: &OpGraph, group: &Group, registry: &AxisRegistry) -> GroupPattern {
    Classifier::new(graph, registry).classify(group)
}

fn error(op: Option<OpId>, error_string: String) -> GroupPattern {
    GroupPattern::Error(ErrorPattern { op, error_string })
}
