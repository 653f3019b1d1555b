use nalgebra::DMatrix;
use tracing::warn;

use crate::error::{GraphReprError, Result};

/// Fixed per-node feature layout shared by every graph state a model sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStateSpec {
    num_node_ids: usize,
    node_state_size: usize,
}

impl GraphStateSpec {
    pub fn new(num_node_ids: usize, node_state_size: usize) -> Self {
        Self {
            num_node_ids,
            node_state_size,
        }
    }

    pub fn num_node_ids(&self) -> usize {
        self.num_node_ids
    }

    pub fn node_state_size(&self) -> usize {
        self.node_state_size
    }

    /// Width of one node's concatenated `ids ++ state` feature vector.
    pub fn feature_width(&self) -> usize {
        self.num_node_ids.saturating_add(self.node_state_size)
    }
}

/// A batch of `n_batch` graphs with `n_nodes` node slots each.
///
/// Buffers are row-major over `(graph, node, feature)`. Each slot carries a
/// soft existence strength in `[0, 1]`; a strength of 0 marks an absent node.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphState {
    spec: GraphStateSpec,
    n_batch: usize,
    n_nodes: usize,
    node_ids: Vec<f32>,
    node_states: Vec<f32>,
    node_strengths: Vec<f32>,
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        warn!(what, expected, actual, "rejecting graph state buffer");
        return Err(GraphReprError::WidthMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

// Buffer lengths `(slots, id values, state values)` for a batch shape, or an
// error when any of them overflows `usize`.
fn buffer_lens(
    spec: &GraphStateSpec,
    n_batch: usize,
    n_nodes: usize,
) -> Result<(usize, usize, usize)> {
    let lens = n_batch.checked_mul(n_nodes).and_then(|slots| {
        Some((
            slots,
            slots.checked_mul(spec.num_node_ids)?,
            slots.checked_mul(spec.node_state_size)?,
        ))
    });
    lens.ok_or_else(|| {
        warn!(n_batch, n_nodes, "rejecting oversized graph state");
        GraphReprError::InvalidConfig(format!(
            "graph state of {n_batch} graphs x {n_nodes} nodes overflows buffer sizes"
        ))
    })
}

fn check_finite(graph: usize, node: usize, values: &[f32]) -> Result<()> {
    if let Some(&value) = values.iter().find(|v| !v.is_finite()) {
        warn!(graph, node, value, "rejecting non-finite node feature");
        return Err(GraphReprError::NonFiniteFeature { graph, node, value });
    }
    Ok(())
}

// Strengths outside [0, 1] are rejected rather than clamped.
fn check_strength(graph: usize, node: usize, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        warn!(graph, node, value, "rejecting node strength");
        return Err(GraphReprError::StrengthOutOfRange { graph, node, value });
    }
    Ok(())
}

impl GraphState {
    pub fn new(
        spec: GraphStateSpec,
        n_batch: usize,
        n_nodes: usize,
        node_ids: Vec<f32>,
        node_states: Vec<f32>,
        node_strengths: Vec<f32>,
    ) -> Result<Self> {
        let (slots, id_len, state_len) = buffer_lens(&spec, n_batch, n_nodes)?;
        check_len("node_ids length", id_len, node_ids.len())?;
        check_len("node_states length", state_len, node_states.len())?;
        check_len("node_strengths length", slots, node_strengths.len())?;

        let (ids, states) = (spec.num_node_ids, spec.node_state_size);
        for (slot, &value) in node_strengths.iter().enumerate() {
            let (graph, node) = (slot / n_nodes, slot % n_nodes);
            check_strength(graph, node, value)?;
            check_finite(graph, node, &node_ids[slot * ids..(slot + 1) * ids])?;
            check_finite(graph, node, &node_states[slot * states..(slot + 1) * states])?;
        }

        Ok(Self {
            spec,
            n_batch,
            n_nodes,
            node_ids,
            node_states,
            node_strengths,
        })
    }

    /// A state with every slot zeroed, including strengths.
    pub fn zeros(spec: GraphStateSpec, n_batch: usize, n_nodes: usize) -> Result<Self> {
        let (slots, id_len, state_len) = buffer_lens(&spec, n_batch, n_nodes)?;
        Ok(Self {
            spec,
            n_batch,
            n_nodes,
            node_ids: vec![0.0; id_len],
            node_states: vec![0.0; state_len],
            node_strengths: vec![0.0; slots],
        })
    }

    pub fn spec(&self) -> &GraphStateSpec {
        &self.spec
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn node_strengths(&self) -> &[f32] {
        &self.node_strengths
    }

    fn slot(&self, graph: usize, node: usize) -> Option<usize> {
        (graph < self.n_batch && node < self.n_nodes).then(|| graph * self.n_nodes + node)
    }

    fn slot_or_err(&self, graph: usize, node: usize) -> Result<usize> {
        self.slot(graph, node).ok_or(GraphReprError::IndexOutOfBounds {
            graph,
            node,
            n_batch: self.n_batch,
            n_nodes: self.n_nodes,
        })
    }

    pub fn node_id(&self, graph: usize, node: usize) -> Option<&[f32]> {
        let width = self.spec.num_node_ids;
        let slot = self.slot(graph, node)?;
        self.node_ids.get(slot * width..(slot + 1) * width)
    }

    pub fn node_state(&self, graph: usize, node: usize) -> Option<&[f32]> {
        let width = self.spec.node_state_size;
        let slot = self.slot(graph, node)?;
        self.node_states.get(slot * width..(slot + 1) * width)
    }

    pub fn node_strength(&self, graph: usize, node: usize) -> Option<f32> {
        let slot = self.slot(graph, node)?;
        self.node_strengths.get(slot).copied()
    }

    /// Overwrites one node slot.
    pub fn set_node(
        &mut self,
        graph: usize,
        node: usize,
        ids: &[f32],
        state: &[f32],
        strength: f32,
    ) -> Result<()> {
        let slot = self.slot_or_err(graph, node)?;
        let (id_width, state_width) = (self.spec.num_node_ids, self.spec.node_state_size);
        check_len("node id width", id_width, ids.len())?;
        check_len("node state width", state_width, state.len())?;
        check_strength(graph, node, strength)?;
        check_finite(graph, node, ids)?;
        check_finite(graph, node, state)?;

        self.node_ids[slot * id_width..(slot + 1) * id_width].copy_from_slice(ids);
        self.node_states[slot * state_width..(slot + 1) * state_width].copy_from_slice(state);
        self.node_strengths[slot] = strength;
        Ok(())
    }

    /// One row per node slot, each row being the node's ids followed by its
    /// state. Rows run over graphs first, then nodes.
    pub fn flat_features(&self) -> DMatrix<f32> {
        let ids = self.spec.num_node_ids;
        let states = self.spec.node_state_size;
        DMatrix::from_fn(self.n_batch * self.n_nodes, ids + states, |row, col| {
            if col < ids {
                self.node_ids[row * ids + col]
            } else {
                self.node_states[row * states + (col - ids)]
            }
        })
    }

    /// Copy of this state with graph `graph`'s node slots reordered so that
    /// new slot `i` holds old slot `order[i]`.
    pub fn permute_nodes(&self, graph: usize, order: &[usize]) -> Result<Self> {
        if graph >= self.n_batch {
            return Err(GraphReprError::IndexOutOfBounds {
                graph,
                node: 0,
                n_batch: self.n_batch,
                n_nodes: self.n_nodes,
            });
        }
        check_len("permutation length", self.n_nodes, order.len())?;
        let mut seen = vec![false; self.n_nodes];
        for &old in order {
            match seen.get_mut(old) {
                Some(flag) if !*flag => *flag = true,
                _ => {
                    return Err(GraphReprError::InvalidConfig(format!(
                        "{order:?} is not a permutation of 0..{}",
                        self.n_nodes
                    )));
                }
            }
        }

        let mut permuted = self.clone();
        for (new, &old) in order.iter().enumerate() {
            let src = self.slot_or_err(graph, old)?;
            let (ids, state) = (self.spec.num_node_ids, self.spec.node_state_size);
            let dst = graph * self.n_nodes + new;
            permuted.node_ids[dst * ids..(dst + 1) * ids]
                .copy_from_slice(&self.node_ids[src * ids..(src + 1) * ids]);
            permuted.node_states[dst * state..(dst + 1) * state]
                .copy_from_slice(&self.node_states[src * state..(src + 1) * state]);
            permuted.node_strengths[dst] = self.node_strengths[src];
        }
        Ok(permuted)
    }
}
