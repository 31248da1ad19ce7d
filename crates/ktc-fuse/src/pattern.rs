//! The closed set of group classifications.
//!
//! Every candidate group classifies to exactly one variant of
//! [`GroupPattern`]. The set is closed on purpose: downstream kernel
//! planning matches exhaustively, so adding a variant is a compile-time
//! event across the codebase, and no two variants can hold at once.
//!
//! Patterns reference operations by [`OpId`] — identity handles into a
//! graph that outlives the classification call — never by copying ops.

use crate::signature::ShardableAxesSignature;
use ktc_graph::OpId;
use serde::{Deserialize, Serialize};

/// Classification failed for a specific operation.
///
/// Diagnostic only: the caller is expected to report `error_string`
/// against `op` and skip fusion for the group. `op` is `None` only when
/// there is no operation to blame (an empty group).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    /// The first offending operation in topological order, if any.
    pub op: Option<OpId>,
    /// Human-readable reason classification failed.
    pub error_string: String,
}

/// A chain of purely injective operations with no reduction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectiveSourcePattern {
    /// Group members in topological order.
    pub ops: Vec<OpId>,
}

/// Exactly one reduction operation and nothing else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleReductionOpPattern {
    /// The reduction.
    pub reduce_op: OpId,
}

/// A reduction composed with surrounding injective structure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionPattern {
    /// Group members in topological order.
    pub ops: Vec<OpId>,
}

/// Operations whose axes correlate only partially for sharding.
///
/// Carries the merged signature for the whole group: the designated output
/// op's axes plus every boundary-crossing operand's axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialShardablePattern {
    /// Group members in topological order.
    pub ops: Vec<OpId>,
    /// The merged axis-sharding record for the group.
    pub shardable_axes_signature: ShardableAxesSignature,
}

/// The result of classifying one candidate group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GroupPattern {
    /// Classification failed; see the payload's diagnostic.
    Error(ErrorPattern),
    /// Injective chain, no reduction.
    InjectiveSource(InjectiveSourcePattern),
    /// A lone reduction op.
    SingleReductionOp(SingleReductionOpPattern),
    /// Reduction with surrounding injective ops.
    Reduction(ReductionPattern),
    /// Partially correlated axes; fallback classification.
    PartialShardable(PartialShardablePattern),
}

impl GroupPattern {
    /// Returns true for the error variant.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns the member operations in topological order.
    ///
    /// Empty for the error variant; a single element for the lone
    /// reduction.
    #[must_use]
    pub fn ops(&self) -> &[OpId] {
        match self {
            Self::Error(_) => &[],
            Self::InjectiveSource(p) => &p.ops,
            Self::SingleReductionOp(p) => std::slice::from_ref(&p.reduce_op),
            Self::Reduction(p) => &p.ops,
            Self::PartialShardable(p) => &p.ops,
        }
    }

    /// Returns a short name for the variant, for logs and reports.
    #[must_use]
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::InjectiveSource(_) => "injective_source",
            Self::SingleReductionOp(_) => "single_reduction_op",
            Self::Reduction(_) => "reduction",
            Self::PartialShardable(_) => "partial_shardable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktc_index::Idx;

    #[test]
    fn test_ops_accessor_covers_every_variant() {
        let a = OpId::new(0);
        let b = OpId::new(1);

        let error = GroupPattern::Error(ErrorPattern {
            op: None,
            error_string: "empty".into(),
        });
        assert!(error.is_error());
        assert!(error.ops().is_empty());

        let single = GroupPattern::SingleReductionOp(SingleReductionOpPattern { reduce_op: b });
        assert_eq!(single.ops(), &[b]);

        let chain = GroupPattern::InjectiveSource(InjectiveSourcePattern { ops: vec![a, b] });
        assert_eq!(chain.ops(), &[a, b]);
        assert!(!chain.is_error());
    }

    #[test]
    fn test_variant_names_are_distinct() {
        let a = OpId::new(0);
        let patterns = [
            GroupPattern::Error(ErrorPattern {
                op: Some(a),
                error_string: String::new(),
            }),
            GroupPattern::InjectiveSource(InjectiveSourcePattern { ops: vec![a] }),
            GroupPattern::SingleReductionOp(SingleReductionOpPattern { reduce_op: a }),
            GroupPattern::Reduction(ReductionPattern { ops: vec![a] }),
            GroupPattern::PartialShardable(PartialShardablePattern {
                ops: vec![a],
                shardable_axes_signature: ShardableAxesSignature::default(),
            }),
        ];
        let mut names: Vec<_> = patterns.iter().map(|p| p.variant_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), patterns.len());
    }
}
