//! # KTC Operation Graph
//!
//! The query surface over a tensor-computation graph that fusion analysis
//! consumes. The graph is an append-only arena of single-output operation
//! nodes: each node records its opcode, a semantic [`OpKind`], its operand
//! sources, its result rank, and per-axis naming hints.
//!
//! Fusion analysis never mutates a graph. Everything downstream of
//! construction takes `&OpGraph` and refers to operations by [`OpId`], a
//! stable identity handle whose lifetime is the graph's.
//!
//! ## Topological invariant
//!
//! [`OpGraph::add_op`] rejects operands that do not already exist, so every
//! operand id is strictly less than its consumer's id. Ascending [`OpId`]
//! order is therefore always a valid topological order, which is what makes
//! group member ordering deterministic.
//!
//! ## Main Types
//!
//! - [`OpGraph`]: the arena and its query methods
//! - [`OpId`]: stable operation identity
//! - [`OpKind`]: the semantics fusion analysis needs from an opcode
//! - [`OpSpec`]: builder input for one operation
//! - [`Group`]: a candidate fusion group (member set + induced adjacency)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use ktc_index::{Idx, IndexVec};
use ktc_intern::Symbol;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// A unique identifier for operations in an [`OpGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(u32);

impl Idx for OpId {
    fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The semantic kind of an operation, as far as fusion analysis cares.
///
/// This is deliberately coarser than an opcode: it captures exactly the
/// axis-correspondence behavior that signature derivation and pattern
/// classification consume, and nothing else about the op's numerics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// A graph entry: parameter, constant, or other producer with no
    /// operands. Injective by convention.
    Source,

    /// Rank-preserving elementwise op (unary or n-ary). Each input axis
    /// maps one-to-one onto the output axis at the same position.
    Elementwise,

    /// Rank-preserving dimension permutation. Output axis `i` corresponds
    /// to input axis `perm[i]`.
    Transpose {
        /// The permutation, `perm.len()` == rank.
        perm: SmallVec<[usize; 4]>,
    },

    /// Broadcast introducing new axes. Output positions listed in
    /// `inserted` are new; the remaining output positions correspond to
    /// the input's axes in order.
    Broadcast {
        /// Output axis positions that have no input ancestor, ascending.
        inserted: SmallVec<[usize; 2]>,
    },

    /// Arbitrary reshape. No axis correspondence survives.
    Reshape,

    /// Reduction along `axes` of the single operand.
    Reduce {
        /// Input axis positions being reduced, ascending.
        axes: SmallVec<[usize; 2]>,
        /// Whether reduced axes are kept (with collapsed extent) in the
        /// output.
        keepdims: bool,
    },

    /// Irregular access or unknown semantics. No axis correspondence is
    /// assumed.
    Opaque,
}

impl OpKind {
    /// Returns true if this kind maps output elements one-to-one from
    /// input elements with rank/shape correspondence preserved.
    ///
    /// Broadcasts are deliberately excluded: an inserted axis has no input
    /// ancestor, which breaks end-to-end axis correlation even though the
    /// index mapping is one-to-one.
    #[must_use]
    pub const fn is_injective(&self) -> bool {
        matches!(self, Self::Source | Self::Elementwise | Self::Transpose { .. })
    }

    /// Returns true if this kind aggregates values along one or more axes.
    #[must_use]
    pub const fn is_reduction(&self) -> bool {
        matches!(self, Self::Reduce { .. })
    }
}

/// One operation node in the graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpNode {
    /// The opcode name ("add", "sum", "broadcast_to", ...).
    pub opcode: Symbol,
    /// Semantic kind.
    pub kind: OpKind,
    /// Operand sources, in operand-position order. Each entry is the
    /// producer of the value consumed at that position.
    pub operands: SmallVec<[OpId; 2]>,
    /// Rank of the single result.
    pub rank: usize,
    /// Naming hint per result axis; always `rank` entries.
    pub axis_names: SmallVec<[Symbol; 4]>,
}

/// Builder input for [`OpGraph::add_op`].
#[derive(Clone, Debug)]
pub struct OpSpec {
    /// The opcode name.
    pub opcode: Symbol,
    /// Semantic kind.
    pub kind: OpKind,
    /// Operand sources in position order.
    pub operands: SmallVec<[OpId; 2]>,
    /// Declared result rank.
    pub rank: usize,
    /// Optional per-axis naming hints; synthesized as `d0..dN` if absent.
    pub axis_names: Option<SmallVec<[Symbol; 4]>>,
}

impl OpSpec {
    /// A graph entry with no operands.
    #[must_use]
    pub fn source(opcode: &str, rank: usize) -> Self {
        Self {
            opcode: Symbol::intern(opcode),
            kind: OpKind::Source,
            operands: SmallVec::new(),
            rank,
            axis_names: None,
        }
    }

    /// A rank-preserving elementwise op.
    #[must_use]
    pub fn elementwise(opcode: &str, operands: impl IntoIterator<Item = OpId>, rank: usize) -> Self {
        Self {
            opcode: Symbol::intern(opcode),
            kind: OpKind::Elementwise,
            operands: operands.into_iter().collect(),
            rank,
            axis_names: None,
        }
    }

    /// A dimension permutation; rank is the permutation length.
    #[must_use]
    pub fn transpose(operand: OpId, perm: impl IntoIterator<Item = usize>) -> Self {
        let perm: SmallVec<[usize; 4]> = perm.into_iter().collect();
        let rank = perm.len();
        Self {
            opcode: Symbol::intern("transpose"),
            kind: OpKind::Transpose { perm },
            operands: smallvec::smallvec![operand],
            rank,
            axis_names: None,
        }
    }

    /// A broadcast inserting new axes at the given output positions.
    #[must_use]
    pub fn broadcast(operand: OpId, inserted: impl IntoIterator<Item = usize>, rank: usize) -> Self {
        Self {
            opcode: Symbol::intern("broadcast_to"),
            kind: OpKind::Broadcast {
                inserted: inserted.into_iter().collect(),
            },
            operands: smallvec::smallvec![operand],
            rank,
            axis_names: None,
        }
    }

    /// An arbitrary reshape to the given rank.
    #[must_use]
    pub fn reshape(operand: OpId, rank: usize) -> Self {
        Self {
            opcode: Symbol::intern("reshape"),
            kind: OpKind::Reshape,
            operands: smallvec::smallvec![operand],
            rank,
            axis_names: None,
        }
    }

    /// A reduction along `axes` of the operand.
    #[must_use]
    pub fn reduce(
        opcode: &str,
        operand: OpId,
        axes: impl IntoIterator<Item = usize>,
        keepdims: bool,
        rank: usize,
    ) -> Self {
        Self {
            opcode: Symbol::intern(opcode),
            kind: OpKind::Reduce {
                axes: axes.into_iter().collect(),
                keepdims,
            },
            operands: smallvec::smallvec![operand],
            rank,
            axis_names: None,
        }
    }

    /// An opaque op with the given operands and result rank.
    #[must_use]
    pub fn opaque(opcode: &str, operands: impl IntoIterator<Item = OpId>, rank: usize) -> Self {
        Self {
            opcode: Symbol::intern(opcode),
            kind: OpKind::Opaque,
            operands: operands.into_iter().collect(),
            rank,
            axis_names: None,
        }
    }

    /// Attaches per-axis naming hints.
    #[must_use]
    pub fn with_axis_names(mut self, names: impl IntoIterator<Item = Symbol>) -> Self {
        self.axis_names = Some(names.into_iter().collect());
        self
    }
}

/// Errors from graph construction.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// An operand referred to an operation not yet in the graph.
    #[error("operand {operand:?} does not precede the operation being added")]
    ForwardOperand {
        /// The offending operand reference.
        operand: OpId,
    },

    /// The axis-name hint list does not match the declared rank.
    #[error("expected {expected} axis names, got {got}")]
    AxisNameCount {
        /// Declared rank.
        expected: usize,
        /// Hints supplied.
        got: usize,
    },
}

/// An append-only arena of operation nodes.
///
/// Semantic validation of rank/arity against operand nodes is deliberately
/// NOT done here: those contracts belong to signature derivation, which
/// must be able to surface them per-operation as classification errors.
#[derive(Clone, Debug, Default)]
pub struct OpGraph {
    nodes: IndexVec<OpId, OpNode>,
}

impl OpGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operation, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::ForwardOperand`] if an operand id is not
    /// already in the graph, or [`GraphError::AxisNameCount`] if naming
    /// hints were supplied with the wrong length.
    pub fn add_op(&mut self, spec: OpSpec) -> Result<OpId, GraphError> {
        let next = self.nodes.next_index();
        for &operand in &spec.operands {
            if operand.index() >= next.index() {
                return Err(GraphError::ForwardOperand { operand });
            }
        }
        let axis_names = match spec.axis_names {
            Some(names) => {
                if names.len() != spec.rank {
                    return Err(GraphError::AxisNameCount {
                        expected: spec.rank,
                        got: names.len(),
                    });
                }
                names
            }
            None => (0..spec.rank)
                .map(|d| Symbol::intern(&format!("d{d}")))
                .collect(),
        };
        Ok(self.nodes.push(OpNode {
            opcode: spec.opcode,
            kind: spec.kind,
            operands: spec.operands,
            rank: spec.rank,
            axis_names,
        }))
    }

    /// Returns the node for `op`, if it exists.
    #[must_use]
    pub fn get(&self, op: OpId) -> Option<&OpNode> {
        self.nodes.get(op)
    }

    /// Returns the node for `op`.
    ///
    /// # Panics
    ///
    /// Panics if `op` is not in this graph.
    #[must_use]
    pub fn node(&self, op: OpId) -> &OpNode {
        &self.nodes[op]
    }

    /// Returns true if `op` belongs to this graph.
    #[must_use]
    pub fn contains(&self, op: OpId) -> bool {
        self.nodes.contains(op)
    }

    /// Returns the opcode of `op`.
    #[must_use]
    pub fn opcode(&self, op: OpId) -> Symbol {
        self.nodes[op].opcode
    }

    /// Returns the semantic kind of `op`.
    #[must_use]
    pub fn kind(&self, op: OpId) -> &OpKind {
        &self.nodes[op].kind
    }

    /// Returns the operand sources of `op` in position order.
    #[must_use]
    pub fn operands(&self, op: OpId) -> &[OpId] {
        &self.nodes[op].operands
    }

    /// Returns the result rank of `op`.
    #[must_use]
    pub fn result_rank(&self, op: OpId) -> usize {
        self.nodes[op].rank
    }

    /// Returns the per-axis naming hints of `op` (always `rank` entries).
    #[must_use]
    pub fn axis_names(&self, op: OpId) -> &[Symbol] {
        &self.nodes[op].axis_names
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over all operation ids in topological (insertion) order.
    pub fn ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.nodes.indices()
    }
}

/// A candidate fusion group: a set of operations evaluated jointly.
///
/// Members are stored deduplicated in ascending id order, which by the
/// graph's construction invariant is a topological order. The induced
/// internal adjacency (producer/consumer edges between members) is
/// computed on demand against a graph.
#[derive(Clone, Debug)]
pub struct Group {
    members: Vec<OpId>,
    set: FxHashSet<OpId>,
}

impl Group {
    /// Creates a group from member ids; duplicates are dropped.
    #[must_use]
    pub fn new(members: impl IntoIterator<Item = OpId>) -> Self {
        let set: FxHashSet<OpId> = members.into_iter().collect();
        let mut members: Vec<OpId> = set.iter().copied().collect();
        members.sort_unstable();
        Self { members, set }
    }

    /// Returns the members in ascending (topological) order.
    #[must_use]
    pub fn members(&self) -> &[OpId] {
        &self.members
    }

    /// Returns true if `op` is a member.
    #[must_use]
    pub fn contains(&self, op: OpId) -> bool {
        self.set.contains(&op)
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns true if the members form one connected component under the
    /// induced (undirected) producer/consumer adjacency.
    ///
    /// Members missing from `graph` contribute no edges. Empty and
    /// singleton groups are connected.
    #[must_use]
    pub fn is_connected(&self, graph: &OpGraph) -> bool {
        if self.members.len() <= 1 {
            return true;
        }

        // Undirected adjacency restricted to members, via operand edges.
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.members.len()];
        let position: rustc_hash::FxHashMap<OpId, usize> = self
            .members
            .iter()
            .enumerate()
            .map(|(i, &op)| (op, i))
            .collect();
        for (i, &op) in self.members.iter().enumerate() {
            let Some(node) = graph.get(op) else { continue };
            for &operand in &node.operands {
                if let Some(&j) = position.get(&operand) {
                    adjacency[i].push(j);
                    adjacency[j].push(i);
                }
            }
        }

        let mut seen = vec![false; self.members.len()];
        let mut stack = vec![0];
        seen[0] = true;
        let mut reached = 1;
        while let Some(i) = stack.pop() {
            for &j in &adjacency[i] {
                if !seen[j] {
                    seen[j] = true;
                    reached += 1;
                    stack.push(j);
                }
            }
        }
        reached == self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_op_rejects_forward_operand() {
        let mut graph = OpGraph::new();
        let bogus = OpId::new(7);
        let err = graph
            .add_op(OpSpec::elementwise("relu", [bogus], 2))
            .unwrap_err();
        assert_eq!(err, GraphError::ForwardOperand { operand: bogus });
    }

    #[test]
    fn test_add_op_rejects_bad_axis_name_count() {
        let mut graph = OpGraph::new();
        let spec = OpSpec::source("param", 2).with_axis_names([Symbol::intern("batch")]);
        let err = graph.add_op(spec).unwrap_err();
        assert_eq!(
            err,
            GraphError::AxisNameCount {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_axis_names_synthesized() {
        let mut graph = OpGraph::new();
        let p = graph.add_op(OpSpec::source("param", 3)).unwrap();
        let names: Vec<&str> = graph.axis_names(p).iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["d0", "d1", "d2"]);
    }

    #[test]
    fn test_ids_are_topological() {
        let mut graph = OpGraph::new();
        let p = graph.add_op(OpSpec::source("param", 1)).unwrap();
        let r = graph.add_op(OpSpec::elementwise("relu", [p], 1)).unwrap();
        let s = graph
            .add_op(OpSpec::reduce("sum", r, [0], false, 0))
            .unwrap();
        assert!(p < r && r < s);
    }

    #[test]
    fn test_group_dedup_and_order() {
        let group = Group::new([OpId::new(3), OpId::new(1), OpId::new(3)]);
        assert_eq!(group.len(), 2);
        assert_eq!(group.members(), &[OpId::new(1), OpId::new(3)]);
        assert!(group.contains(OpId::new(3)));
        assert!(!group.contains(OpId::new(0)));
    }

    #[test]
    fn test_group_connectivity() {
        let mut graph = OpGraph::new();
        let p = graph.add_op(OpSpec::source("param", 1)).unwrap();
        let a = graph.add_op(OpSpec::elementwise("relu", [p], 1)).unwrap();
        let b = graph.add_op(OpSpec::elementwise("exp", [a], 1)).unwrap();
        let q = graph.add_op(OpSpec::source("param", 1)).unwrap();
        let c = graph.add_op(OpSpec::elementwise("neg", [q], 1)).unwrap();

        assert!(Group::new([a, b]).is_connected(&graph));
        assert!(Group::new([a]).is_connected(&graph));
        // `c` hangs off a different source; no internal edge to {a, b}.
        assert!(!Group::new([a, b, c]).is_connected(&graph));
    }
}
