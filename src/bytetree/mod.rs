//! # ByteTree Module
//!
//! The mutable aggregation tree used during grouped query execution: a
//! radix-style tree keyed by the bytes of the grouped dimension map, whose
//! leaves hold one [`Sequence`] per output field.
//!
//! As rows stream out of the underlying source, [`ByteTree::update`]
//! navigates (or grows) the tree and reaggregates each row's sequences into
//! the leaf at the requested output resolution and time window. Once the
//! run is complete, [`ByteTree::walk`] visits the leaves in key order —
//! exactly one row per distinct grouped key.
//!
//! ## Invariants
//!
//! - Edge labels at a node start with distinct bytes and are kept in byte
//!   order, so the in-order walk yields keys sorted.
//! - Leaf sequences are allocated over the whole query window, never more
//!   than `ceil((until − asOf) / out_res)` buckets.
//! - Reaggregation goes through the fields' merge laws, which are
//!   commutative and associative, so the result is independent of row
//!   arrival order.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;

use thiserror::Error;

use crate::bytemap::ByteMap;
use crate::encoding::{DurationNanos, Sequence, Time, bucket_start};
use crate::expr::Field;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while constructing an aggregation tree.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ByteTreeError {
    /// Neither resolution divides the other, so buckets cannot be mapped.
    #[error("incompatible resolutions: out {out} vs in {input}")]
    IncompatibleResolutions {
        /// Requested output bucket width.
        out: DurationNanos,
        /// Source bucket width.
        input: DurationNanos,
    },

    /// Output and input field lists do not pair up.
    #[error("field mismatch: {0}")]
    FieldMismatch(String),

    /// The query window is empty or inverted.
    #[error("empty window: asOf {as_of} until {until}")]
    EmptyWindow {
        /// Window start (inclusive).
        as_of: Time,
        /// Window end (exclusive).
        until: Time,
    },
}

// ------------------------------------------------------------------------------------------------
// Nodes
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Edge {
    label: Vec<u8>,
    child: Node,
}

#[derive(Debug, Default)]
struct Node {
    edges: Vec<Edge>,
    /// Per-output-field sequences; present only on leaves.
    data: Option<Vec<Sequence>>,
}

impl Node {
    fn new() -> Self {
        Node::default()
    }
}

// ------------------------------------------------------------------------------------------------
// ByteTree Core
// ------------------------------------------------------------------------------------------------

/// Grouped reaggregation accumulator for one query.
#[derive(Debug)]
pub struct ByteTree {
    out_fields: Arc<[Field]>,
    in_fields: Arc<[Field]>,
    out_res: DurationNanos,
    in_res: DurationNanos,
    /// Start time of the newest bucket in the window.
    window_head: Time,
    /// Start time of the oldest bucket in the window.
    window_tail: Time,
    periods: usize,
    root: Node,
    leaves: usize,
}

impl ByteTree {
    /// Builds a tree for the window `[as_of, until)` reaggregating from
    /// `in_res` to `out_res`.
    ///
    /// Fails fast when the resolutions cannot be mapped or the field lists
    /// do not pair up — better at build time than per row.
    pub fn new(
        out_fields: Arc<[Field]>,
        in_fields: Arc<[Field]>,
        out_res: DurationNanos,
        in_res: DurationNanos,
        as_of: Time,
        until: Time,
    ) -> Result<Self, ByteTreeError> {
        if out_res <= 0 || in_res <= 0 || (out_res % in_res != 0 && in_res % out_res != 0) {
            return Err(ByteTreeError::IncompatibleResolutions {
                out: out_res,
                input: in_res,
            });
        }
        if out_fields.len() != in_fields.len() {
            return Err(ByteTreeError::FieldMismatch(format!(
                "{} output fields vs {} input fields",
                out_fields.len(),
                in_fields.len()
            )));
        }
        for (out, input) in out_fields.iter().zip(in_fields.iter()) {
            if out.expr.encoded_width() != input.expr.encoded_width() {
                return Err(ByteTreeError::FieldMismatch(format!(
                    "accumulator width differs for '{}' vs '{}'",
                    out.name, input.name
                )));
            }
        }
        if until <= as_of {
            return Err(ByteTreeError::EmptyWindow { as_of, until });
        }

        let window_head = bucket_start(until - 1, out_res);
        let window_tail = bucket_start(as_of, out_res);
        let periods = ((window_head - window_tail) / out_res) as usize + 1;

        Ok(Self {
            out_fields,
            in_fields,
            out_res,
            in_res,
            window_head,
            window_tail,
            periods,
            root: Node::new(),
            leaves: 0,
        })
    }

    /// Number of distinct grouped keys seen so far.
    pub fn num_leaves(&self) -> usize {
        self.leaves
    }

    /// Folds one row into the leaf at `key`.
    ///
    /// `vals` are the row's sequences, parallel to the input field list;
    /// `metadata` is the row's original ungrouped dims, available to
    /// expressions that read dimensions outside the grouped key.
    pub fn update(&mut self, key: &ByteMap, vals: &[Sequence], metadata: &ByteMap) {
        let data = Self::leaf_for(
            &mut self.root,
            key.as_bytes(),
            &mut self.leaves,
            &self.out_fields,
            self.window_head,
            self.periods,
        );
        for (idx, (out, input)) in self
            .out_fields
            .iter()
            .zip(self.in_fields.iter())
            .enumerate()
        {
            let Some(in_seq) = vals.get(idx) else {
                continue;
            };
            data[idx].sub_merge(
                in_seq,
                metadata,
                out.expr.as_ref(),
                input.expr.as_ref(),
                self.out_res,
                self.in_res,
                self.window_tail,
                self.window_head,
            );
        }
    }

    /// Navigates to the leaf for `key`, creating nodes (and splitting
    /// edges on partial matches) as needed.
    fn leaf_for<'a>(
        node: &'a mut Node,
        key: &[u8],
        leaves: &mut usize,
        out_fields: &Arc<[Field]>,
        window_head: Time,
        periods: usize,
    ) -> &'a mut Vec<Sequence> {
        if key.is_empty() {
            if node.data.is_none() {
                node.data = Some(
                    out_fields
                        .iter()
                        .map(|f| {
                            Sequence::with_periods(window_head, periods, f.expr.encoded_width())
                        })
                        .collect(),
                );
                *leaves += 1;
            }
            match node.data.as_mut() {
                Some(data) => return data,
                None => unreachable!("leaf allocated above"),
            }
        }

        match node.edges.binary_search_by(|e| e.label[0].cmp(&key[0])) {
            Err(insert_at) => {
                // No edge shares the first byte: new terminal edge.
                node.edges.insert(
                    insert_at,
                    Edge {
                        label: key.to_vec(),
                        child: Node::new(),
                    },
                );
                Self::leaf_for(
                    &mut node.edges[insert_at].child,
                    &[],
                    leaves,
                    out_fields,
                    window_head,
                    periods,
                )
            }
            Ok(found) => {
                let common = common_prefix_len(&node.edges[found].label, key);
                if common < node.edges[found].label.len() {
                    // Partial match: split the edge at the divergence.
                    let edge = &mut node.edges[found];
                    let suffix = edge.label.split_off(common);
                    let old_child = std::mem::take(&mut edge.child);
                    edge.child.edges.push(Edge {
                        label: suffix,
                        child: old_child,
                    });
                }
                Self::leaf_for(
                    &mut node.edges[found].child,
                    &key[common..],
                    leaves,
                    out_fields,
                    window_head,
                    periods,
                )
            }
        }
    }

    /// In-order traversal of the leaves.
    ///
    /// Stops early when `visit` returns `false`. Returns whether the walk
    /// ran to completion.
    pub fn walk(&self, mut visit: impl FnMut(&[u8], &[Sequence]) -> bool) -> bool {
        let mut key = Vec::new();
        Self::walk_node(&self.root, &mut key, &mut visit)
    }

    fn walk_node(
        node: &Node,
        key: &mut Vec<u8>,
        visit: &mut impl FnMut(&[u8], &[Sequence]) -> bool,
    ) -> bool {
        if let Some(data) = &node.data
            && !visit(key, data)
        {
            return false;
        }
        for edge in &node.edges {
            key.extend_from_slice(&edge.label);
            let keep_going = Self::walk_node(&edge.child, key, visit);
            key.truncate(key.len() - edge.label.len());
            if !keep_going {
                return false;
            }
        }
        true
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
