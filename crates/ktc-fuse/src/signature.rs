//! Shardable-axes signature derivation.
//!
//! A [`ShardableAxesSignature`] records, for one operation, the shardable
//! axes of its output and of every input *as seen by that operation* (after
//! broadcast/transpose semantics, which may differ from the producer's own
//! view). Identity sharing is the load-bearing part of the contract: when
//! an op preserves an axis end-to-end, the output entry reuses the input's
//! [`AxisId`](crate::axes::AxisId), which is what lets classification
//! correlate compatible sharding across a whole chain of operations. When
//! an op severs the correspondence (reduction, reshape, a broadcast's
//! inserted axes, opaque access), the orphaned output axes mint fresh ids.

use crate::axes::{AxisRegistry, ShardableAxes, ShardableAxis};
use ktc_graph::{OpGraph, OpId, OpKind};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One consumed operand position: which operation, and which slot.
///
/// The operation component is a stable identity handle, so two
/// structurally identical operations at different graph positions key
/// distinct entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpOperand {
    /// The consuming operation.
    pub op: OpId,
    /// The operand position within that operation.
    pub index: usize,
}

impl OpOperand {
    /// Creates an operand key.
    #[must_use]
    pub const fn new(op: OpId, index: usize) -> Self {
        Self { op, index }
    }
}

/// The per-operation axis-sharding record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardableAxesSignature {
    /// Axes of the operation's single output.
    pub output_shardable_axes: ShardableAxes,
    /// Axes of each consumed input, keyed by `(operation, operand index)`.
    /// Every declared operand position has exactly one entry.
    pub input_shardable_axes: FxHashMap<OpOperand, ShardableAxes>,
}

/// Failure to derive a signature for an operation.
///
/// These are the rank/arity contract violations that classification must
/// surface as error patterns naming the offending operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The operation consumed the wrong number of operands for its kind.
    #[error("operation {op:?} expects {expected} operand(s), got {got}")]
    OperandCount {
        /// The offending operation.
        op: OpId,
        /// Operand count its kind requires.
        expected: usize,
        /// Operand count it actually has.
        got: usize,
    },

    /// An operand's rank does not satisfy the operation's contract.
    #[error("rank mismatch at operand {operand} of {op:?}: expected rank {expected}, got rank {got}")]
    RankMismatch {
        /// The offending operation.
        op: OpId,
        /// The operand position.
        operand: usize,
        /// Rank the contract requires.
        expected: usize,
        /// Rank the operand actually has.
        got: usize,
    },

    /// The declared result rank disagrees with the rank the operation's
    /// semantics derive from its operands.
    #[error("operation {op:?} declares result rank {declared}, semantics derive rank {derived}")]
    DeclaredRank {
        /// The offending operation.
        op: OpId,
        /// Rank the node declares.
        declared: usize,
        /// Rank derived from operand ranks.
        derived: usize,
    },

    /// A transpose permutation is not a permutation of the result rank.
    #[error("operation {op:?} has an invalid permutation for rank {rank}")]
    InvalidPermutation {
        /// The offending operation.
        op: OpId,
        /// The rank the permutation must cover.
        rank: usize,
    },

    /// A reduction or broadcast axis position is out of bounds.
    #[error("axis {axis} out of bounds for rank {rank} in operation {op:?}")]
    AxisOutOfBounds {
        /// The offending operation.
        op: OpId,
        /// The axis position.
        axis: usize,
        /// The rank it must lie within.
        rank: usize,
    },
}

/// Derives the signature of `op` from the resolved axes of its operands.
///
/// `operand_axes` supplies one [`ShardableAxes`] per declared operand
/// position, in order; the caller resolves these from producer signatures
/// (inside a group) or mints fresh boundary axes (outside it).
///
/// # Errors
///
/// Returns a [`SignatureError`] when the operation's rank or arity
/// contract cannot be satisfied by its actual operands. Callers surface
/// this as an error pattern naming `op`.
pub fn derive_signature(
    graph: &OpGraph,
    op: OpId,
    operand_axes: &[ShardableAxes],
    registry: &AxisRegistry,
) -> Result<ShardableAxesSignature, SignatureError> {
    let node = graph.node(op);
    if operand_axes.len() != node.operands.len() {
        return Err(SignatureError::OperandCount {
            op,
            expected: node.operands.len(),
            got: operand_axes.len(),
        });
    }

    let output_shardable_axes = match &node.kind {
        OpKind::Source => {
            expect_arity(op, operand_axes, 0)?;
            ShardableAxes::fresh(&node.axis_names, registry)
        }

        OpKind::Elementwise => {
            if operand_axes.is_empty() {
                return Err(SignatureError::OperandCount {
                    op,
                    expected: 1,
                    got: 0,
                });
            }
            for (operand, axes) in operand_axes.iter().enumerate() {
                if axes.rank() != node.rank {
                    return Err(SignatureError::RankMismatch {
                        op,
                        operand,
                        expected: node.rank,
                        got: axes.rank(),
                    });
                }
            }
            // Every input axis maps onto the output axis at its own
            // position. Where operands disagree on an identity, operand 0
            // wins; the inputs map below still records each operand's own
            // view, so the disagreement stays observable.
            ShardableAxes::new(
                operand_axes[0]
                    .iter()
                    .enumerate()
                    .map(|(position, axis)| axis.at_position(position)),
            )
        }

        OpKind::Transpose { perm } => {
            expect_arity(op, operand_axes, 1)?;
            let input = &operand_axes[0];
            if input.rank() != node.rank {
                return Err(SignatureError::RankMismatch {
                    op,
                    operand: 0,
                    expected: node.rank,
                    got: input.rank(),
                });
            }
            if !is_permutation(perm, node.rank) {
                return Err(SignatureError::InvalidPermutation { op, rank: node.rank });
            }
            ShardableAxes::new(perm.iter().enumerate().map(|(position, &source)| {
                input.axes()[source].at_position(position)
            }))
        }

        OpKind::Broadcast { inserted } => {
            expect_arity(op, operand_axes, 1)?;
            let input = &operand_axes[0];
            for &position in inserted {
                if position >= node.rank {
                    return Err(SignatureError::AxisOutOfBounds {
                        op,
                        axis: position,
                        rank: node.rank,
                    });
                }
            }
            let inserted: rustc_hash::FxHashSet<usize> = inserted.iter().copied().collect();
            // Distinct insertion count: a duplicated position must not
            // shift the pass-through correspondence.
            let derived = input.rank() + inserted.len();
            if derived != node.rank {
                return Err(SignatureError::DeclaredRank {
                    op,
                    declared: node.rank,
                    derived,
                });
            }
            let mut pass_through = input.iter();
            ShardableAxes::new((0..node.rank).map(|position| {
                if inserted.contains(&position) {
                    // An inserted axis has no input ancestor.
                    ShardableAxis::fresh(position, node.axis_names[position], registry)
                } else {
                    pass_through
                        .next()
                        .expect("pass-through count checked above")
                        .at_position(position)
                }
            }))
        }

        OpKind::Reshape => {
            expect_arity(op, operand_axes, 1)?;
            ShardableAxes::fresh(&node.axis_names, registry)
        }

        OpKind::Reduce { axes, keepdims } => {
            expect_arity(op, operand_axes, 1)?;
            let input = &operand_axes[0];
            for &axis in axes {
                if axis >= input.rank() {
                    return Err(SignatureError::AxisOutOfBounds {
                        op,
                        axis,
                        rank: input.rank(),
                    });
                }
            }
            let reduced: rustc_hash::FxHashSet<usize> = axes.iter().copied().collect();
            let derived = if *keepdims {
                input.rank()
            } else {
                input.rank() - reduced.len()
            };
            if derived != node.rank {
                return Err(SignatureError::DeclaredRank {
                    op,
                    declared: node.rank,
                    derived,
                });
            }
            if *keepdims {
                ShardableAxes::new(input.iter().enumerate().map(|(position, axis)| {
                    if reduced.contains(&position) {
                        // The collapsed axis has no faithful ancestor.
                        ShardableAxis::fresh(position, node.axis_names[position], registry)
                    } else {
                        axis.at_position(position)
                    }
                }))
            } else {
                ShardableAxes::new(
                    input
                        .iter()
                        .enumerate()
                        .filter(|(position, _)| !reduced.contains(position))
                        .enumerate()
                        .map(|(position, (_, axis))| axis.at_position(position)),
                )
            }
        }

        OpKind::Opaque => ShardableAxes::fresh(&node.axis_names, registry),
    };

    let input_shardable_axes = operand_axes
        .iter()
        .enumerate()
        .map(|(index, axes)| (OpOperand::new(op, index), axes.clone()))
        .collect();

    Ok(ShardableAxesSignature {
        output_shardable_axes,
        input_shardable_axes,
    })
}

fn expect_arity(
    op: OpId,
    operand_axes: &[ShardableAxes],
    expected: usize,
) -> Result<(), SignatureError> {
    if operand_axes.len() == expected {
        Ok(())
    } else {
        Err(SignatureError::OperandCount {
            op,
            expected,
            got: operand_axes.len(),
        })
    }
}

fn is_permutation(perm: &[usize], rank: usize) -> bool {
    if perm.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktc_graph::OpSpec;
    use ktc_intern::Symbol;

    fn names(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(|n| Symbol::intern(n)).collect()
    }

    #[test]
    fn test_elementwise_threads_identities() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 2)).unwrap();
        let relu = graph.add_op(OpSpec::elementwise("relu", [x], 2)).unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let sig = derive_signature(&graph, relu, &[x_axes.clone()], &registry).unwrap();

        assert_eq!(sig.output_shardable_axes.rank(), 2);
        for position in 0..2 {
            assert_eq!(
                sig.output_shardable_axes.get(position).unwrap().id,
                x_axes.get(position).unwrap().id
            );
        }
        assert_eq!(sig.input_shardable_axes.len(), 1);
        assert_eq!(
            sig.input_shardable_axes[&OpOperand::new(relu, 0)],
            x_axes
        );
    }

    #[test]
    fn test_elementwise_rank_mismatch() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 3)).unwrap();
        // Declared rank 2, but the operand is rank 3.
        let add = graph.add_op(OpSpec::elementwise("add", [x], 2)).unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let err = derive_signature(&graph, add, &[x_axes], &registry).unwrap_err();
        assert!(err.to_string().contains("rank"));
        assert_eq!(
            err,
            SignatureError::RankMismatch {
                op: add,
                operand: 0,
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_transpose_permutes_positions() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 3)).unwrap();
        let t = graph.add_op(OpSpec::transpose(x, [2, 0, 1])).unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let sig = derive_signature(&graph, t, &[x_axes.clone()], &registry).unwrap();

        let out = &sig.output_shardable_axes;
        assert_eq!(out.get(0).unwrap().id, x_axes.get(2).unwrap().id);
        assert_eq!(out.get(1).unwrap().id, x_axes.get(0).unwrap().id);
        assert_eq!(out.get(2).unwrap().id, x_axes.get(1).unwrap().id);
        assert_eq!(out.get(0).unwrap().axis, 0);
    }

    #[test]
    fn test_transpose_invalid_permutation() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 2)).unwrap();
        let t = graph.add_op(OpSpec::transpose(x, [0, 0])).unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let err = derive_signature(&graph, t, &[x_axes], &registry).unwrap_err();
        assert!(matches!(err, SignatureError::InvalidPermutation { .. }));
    }

    #[test]
    fn test_broadcast_inserted_axes_are_fresh() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 2)).unwrap();
        let b = graph
            .add_op(
                OpSpec::broadcast(x, [0], 3)
                    .with_axis_names(names(&["batch", "m", "n"])),
            )
            .unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let sig = derive_signature(&graph, b, &[x_axes.clone()], &registry).unwrap();

        let out = &sig.output_shardable_axes;
        assert_eq!(out.rank(), 3);
        // Position 0 is new; its identity matches nothing upstream.
        assert!(x_axes.iter().all(|a| a.id != out.get(0).unwrap().id));
        assert_eq!(out.get(0).unwrap().axis_name.as_str(), "batch");
        // Positions 1 and 2 pass through in order.
        assert_eq!(out.get(1).unwrap().id, x_axes.get(0).unwrap().id);
        assert_eq!(out.get(2).unwrap().id, x_axes.get(1).unwrap().id);
    }

    #[test]
    fn test_reduce_keepdims_mints_fresh_axis() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 2)).unwrap();
        let s = graph
            .add_op(OpSpec::reduce("sum", x, [0], true, 2))
            .unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let sig = derive_signature(&graph, s, &[x_axes.clone()], &registry).unwrap();

        let out = &sig.output_shardable_axes;
        assert_ne!(out.get(0).unwrap().id, x_axes.get(0).unwrap().id);
        assert_eq!(out.get(1).unwrap().id, x_axes.get(1).unwrap().id);
    }

    #[test]
    fn test_reduce_dropped_axis_shifts_positions() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 3)).unwrap();
        let s = graph
            .add_op(OpSpec::reduce("sum", x, [1], false, 2))
            .unwrap();

        let x_axes = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let sig = derive_signature(&graph, s, &[x_axes.clone()], &registry).unwrap();

        let out = &sig.output_shardable_axes;
        assert_eq!(out.rank(), 2);
        assert_eq!(out.get(0).unwrap().id, x_axes.get(0).unwrap().id);
        // The surviving trailing axis keeps its identity at position 1.
        assert_eq!(out.get(1).unwrap().id, x_axes.get(2).unwrap().id);
        assert_eq!(out.get(1).unwrap().axis, 1);
    }

    #[test]
    fn test_operand_count_error() {
        let mut graph = OpGraph::new();
        let registry = AxisRegistry::new();
        let x = graph.add_op(OpSpec::source("param", 1)).unwrap();
        let y = graph.add_op(OpSpec::source("param", 1)).unwrap();
        // A reduce with two declared operands violates its kind's arity.
        let bad = graph
            .add_op(OpSpec {
                opcode: Symbol::intern("sum"),
                kind: ktc_graph::OpKind::Reduce {
                    axes: smallvec::smallvec![0],
                    keepdims: false,
                },
                operands: smallvec::smallvec![x, y],
                rank: 0,
                axis_names: None,
            })
            .unwrap();

        let xa = ShardableAxes::fresh(graph.axis_names(x), &registry);
        let ya = ShardableAxes::fresh(graph.axis_names(y), &registry);
        let err = derive_signature(&graph, bad, &[xa, ya], &registry).unwrap_err();
        assert!(err.to_string().contains("operand"));
    }
}
