use nalgebra::{DMatrix, DVector};
use rand::RngCore;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::config::AggregateConfig;
use crate::dropout::{DropoutMasks, MaskSource};
use crate::error::{GraphReprError, Result};
use crate::graph_state::{GraphState, GraphStateSpec};
use crate::layer_stack::{LayerStack, Param, ParamMut};

const STACK_NAME: &str = "aggregaterepr";

// Largest f32 below 1. `tanh` of a sum past ~9 rounds to 1.0 in f32.
const SATURATION: f64 = 1.0 - f32::EPSILON as f64 / 2.0;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `tanh` in f64, clamped so the f32 result stays strictly inside `(-1, 1)`.
fn squash(x: f64) -> f32 {
    x.tanh().clamp(-SATURATION, SATURATION) as f32
}

/// One node's projection, split into its attention gate and its content.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeActivation {
    pub gate_logit: f32,
    pub content: DVector<f32>,
}

impl NodeActivation {
    /// Splits a projected row: the first value is the gate logit, the rest
    /// is content.
    pub fn split(output: &[f32]) -> Option<Self> {
        let (&gate_logit, content) = output.split_first()?;
        Some(Self {
            gate_logit,
            content: DVector::from_column_slice(content),
        })
    }

    /// `sigmoid(gate_logit) * strength`, so a node of strength 0 has weight 0.
    pub fn gate_weight(&self, strength: f32) -> f32 {
        sigmoid(self.gate_logit) * strength
    }

    pub fn squashed_content(&self) -> DVector<f32> {
        self.content.map(f32::tanh)
    }
}

/// Pools a batch of graph states into one fixed-width vector per graph.
///
/// Each node is projected to a gate logit and a content vector; the graph's
/// representation is `tanh(Σ sigmoid(gate) * strength * tanh(content))`.
/// The sum is accumulated in f64 and the final squash is clamped, so values
/// lie strictly inside `(-1, 1)` even when many nodes saturate. Nodes of
/// strength 0 have no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRepresentation {
    representation_width: usize,
    graph_spec: GraphStateSpec,
    stack: LayerStack,
}

impl AggregateRepresentation {
    /// Builds the projection stack, drawing its initial weights from `rng`.
    pub fn new(config: &AggregateConfig, rng: &mut dyn RngCore) -> Result<Self> {
        config.validate()?;
        let stack = LayerStack::new(STACK_NAME, &config.stack_config(), rng)?;
        debug!(
            representation_width = config.representation_width,
            num_node_ids = config.graph_spec.num_node_ids(),
            node_state_size = config.graph_spec.node_state_size(),
            "built aggregate representation"
        );
        Ok(Self {
            representation_width: config.representation_width,
            graph_spec: config.graph_spec,
            stack,
        })
    }

    /// Wraps a prebuilt stack, which must map node features to
    /// `representation_width + 1` outputs.
    pub fn with_stack(
        representation_width: usize,
        graph_spec: GraphStateSpec,
        stack: LayerStack,
    ) -> Result<Self> {
        if representation_width == 0 {
            return Err(GraphReprError::InvalidConfig(
                "representation_width must be positive".into(),
            ));
        }
        if stack.input_width() != graph_spec.feature_width() {
            return Err(GraphReprError::WidthMismatch {
                what: "stack input width",
                expected: graph_spec.feature_width(),
                actual: stack.input_width(),
            });
        }
        if stack.output_width() != representation_width + 1 {
            return Err(GraphReprError::WidthMismatch {
                what: "stack output width",
                expected: representation_width + 1,
                actual: stack.output_width(),
            });
        }
        Ok(Self {
            representation_width,
            graph_spec,
            stack,
        })
    }

    pub fn representation_width(&self) -> usize {
        self.representation_width
    }

    pub fn graph_spec(&self) -> &GraphStateSpec {
        &self.graph_spec
    }

    pub fn stack(&self) -> &LayerStack {
        &self.stack
    }

    pub fn params(&self) -> Vec<Param<'_>> {
        self.stack.params()
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        self.stack.params_mut()
    }

    /// Draws a mask set that can be shared by several forward passes.
    pub fn dropout_masks(&self, rng: &mut dyn RngCore) -> Result<DropoutMasks> {
        self.stack.dropout_masks(rng)
    }

    /// Forward pass with fresh masks from `rng`. The masks are discarded.
    pub fn process(&self, state: &GraphState, rng: &mut dyn RngCore) -> Result<DMatrix<f32>> {
        let (representation, _) = self.run(state, MaskSource::Sample(rng))?;
        Ok(representation)
    }

    /// Forward pass with fresh masks from `rng`, returned for reuse.
    pub fn process_sampled(
        &self,
        state: &GraphState,
        rng: &mut dyn RngCore,
    ) -> Result<(DMatrix<f32>, DropoutMasks)> {
        self.run(state, MaskSource::Sample(rng))
    }

    /// Forward pass with caller-supplied masks.
    pub fn process_with_masks(
        &self,
        state: &GraphState,
        masks: &DropoutMasks,
    ) -> Result<(DMatrix<f32>, DropoutMasks)> {
        self.run(state, MaskSource::Reuse(masks))
    }

    /// Forward pass with dropout disabled.
    pub fn process_eval(&self, state: &GraphState) -> Result<DMatrix<f32>> {
        self.check_state(state)?;
        let activations = self.stack.process_eval(&state.flat_features())?;
        self.pool(&activations, state)
    }

    /// Per-graph, per-node gate and content before pooling.
    pub fn node_activations(
        &self,
        state: &GraphState,
        masks: &DropoutMasks,
    ) -> Result<Vec<Vec<NodeActivation>>> {
        self.check_state(state)?;
        let (activations, _) = self
            .stack
            .process(&state.flat_features(), MaskSource::Reuse(masks))?;
        (0..state.n_batch())
            .map(|graph| {
                (0..state.n_nodes())
                    .map(|node| self.node_activation(&activations, graph * state.n_nodes() + node))
                    .collect()
            })
            .collect()
    }

    fn run(
        &self,
        state: &GraphState,
        masks: MaskSource<'_>,
    ) -> Result<(DMatrix<f32>, DropoutMasks)> {
        self.check_state(state)?;
        trace!(
            n_batch = state.n_batch(),
            n_nodes = state.n_nodes(),
            "aggregating graph state"
        );
        let (activations, masks) = self.stack.process(&state.flat_features(), masks)?;
        let representation = self.pool(&activations, state)?;
        Ok((representation, masks))
    }

    fn check_state(&self, state: &GraphState) -> Result<()> {
        let spec = state.spec();
        let mismatch = if spec.num_node_ids() != self.graph_spec.num_node_ids() {
            Some(("num_node_ids", self.graph_spec.num_node_ids(), spec.num_node_ids()))
        } else if spec.node_state_size() != self.graph_spec.node_state_size() {
            Some((
                "node_state_size",
                self.graph_spec.node_state_size(),
                spec.node_state_size(),
            ))
        } else {
            None
        };
        if let Some((what, expected, actual)) = mismatch {
            warn!(what, expected, actual, "graph state does not match configured spec");
            return Err(GraphReprError::WidthMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn node_activation(&self, activations: &DMatrix<f32>, row: usize) -> Result<NodeActivation> {
        let output = activations.row(row).clone_owned();
        NodeActivation::split(output.as_slice()).ok_or(GraphReprError::WidthMismatch {
            what: "projected node width",
            expected: self.representation_width + 1,
            actual: output.len(),
        })
    }

    // Row `graph * n_nodes + node` of `activations` belongs to that node.
    fn pool(&self, activations: &DMatrix<f32>, state: &GraphState) -> Result<DMatrix<f32>> {
        let (n_batch, n_nodes) = (state.n_batch(), state.n_nodes());
        let strengths = state.node_strengths();
        if n_batch.checked_mul(self.representation_width).is_none() {
            return Err(GraphReprError::InvalidConfig(format!(
                "{n_batch} graphs x width {} overflows the output size",
                self.representation_width
            )));
        }

        let pooled = (0..n_batch)
            .into_par_iter()
            .map(|graph| -> Result<DVector<f32>> {
                let mut sum = DVector::<f64>::zeros(self.representation_width);
                for node in 0..n_nodes {
                    let row = graph * n_nodes + node;
                    let activation = self.node_activation(activations, row)?;
                    let weight = f64::from(activation.gate_weight(strengths[row]));
                    for (acc, &c) in sum.iter_mut().zip(activation.squashed_content().iter()) {
                        *acc += weight * f64::from(c);
                    }
                }
                Ok(sum.map(squash))
            })
            .collect::<Result<Vec<DVector<f32>>>>()?;

        Ok(DMatrix::from_fn(n_batch, self.representation_width, |graph, j| {
            pooled[graph][j]
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::layer_stack::Linear;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn split_takes_gate_first() {
        let node = NodeActivation::split(&[2.0, 0.5, -0.5]).unwrap();
        assert_eq!(node.gate_logit, 2.0);
        assert_eq!(node.content, DVector::from_vec(vec![0.5, -0.5]));
        assert!(NodeActivation::split(&[]).is_none());
    }

    #[test]
    fn gate_weight_is_bounded_by_strength() {
        let node = NodeActivation::split(&[40.0, 1.0]).unwrap();
        assert_eq!(node.gate_weight(0.0), 0.0);
        assert_abs_diff_eq!(node.gate_weight(0.3), 0.3, epsilon = 1e-6);

        let node = NodeActivation::split(&[0.0, 1.0]).unwrap();
        assert_eq!(node.gate_weight(1.0), 0.5);
    }

    #[test]
    fn squash_never_reaches_one() {
        assert_eq!(squash(0.0), 0.0);
        assert_eq!(squash(50.0), SATURATION as f32);
        assert_eq!(squash(-50.0), -(SATURATION as f32));
        assert!(squash(50.0) < 1.0);
    }

    #[test]
    fn many_saturated_nodes_stay_inside_unit_interval() {
        // gate logit 10 and content 10 for every node, so the sum is about 10
        let spec = GraphStateSpec::new(1, 1);
        let weights = DMatrix::from_row_slice(2, 2, &[10.0, 0.0, 10.0, 0.0]);
        let linear = Linear::from_parts(weights, DVector::zeros(2)).unwrap();
        let stack = LayerStack::from_layers(STACK_NAME, vec![linear], 1.0, false, true).unwrap();
        let model = AggregateRepresentation::with_stack(1, spec, stack).unwrap();
        let state =
            GraphState::new(spec, 1, 10, vec![1.0; 10], vec![0.0; 10], vec![1.0; 10]).unwrap();

        let out = model.process_eval(&state).unwrap();
        assert!(out[(0, 0)] < 1.0, "{out}");
        assert!(out[(0, 0)] > 0.9999);
    }

    #[test]
    fn single_node_with_zero_content_gives_zero() {
        // width 1, gate logit 0, content 0: tanh(0.5 * tanh(0)) = 0
        let spec = GraphStateSpec::new(1, 1);
        let stack =
            LayerStack::from_layers(STACK_NAME, vec![Linear::zeros(2, 2)], 1.0, false, true)
                .unwrap();
        let model = AggregateRepresentation::with_stack(1, spec, stack).unwrap();
        let state = GraphState::new(spec, 1, 1, vec![1.0], vec![0.3], vec![1.0]).unwrap();

        let out = model.process_eval(&state).unwrap();
        assert_eq!(out, DMatrix::zeros(1, 1));

        let nodes = model.node_activations(&state, &DropoutMasks::none(2)).unwrap();
        assert_eq!(nodes[0][0].gate_logit, 0.0);
    }

    #[test]
    fn with_stack_rejects_mismatched_widths() {
        let spec = GraphStateSpec::new(2, 3);
        let stack = |i, o| {
            LayerStack::from_layers(STACK_NAME, vec![Linear::zeros(i, o)], 1.0, false, true)
                .unwrap()
        };
        assert!(AggregateRepresentation::with_stack(4, spec, stack(5, 5)).is_ok());
        assert!(AggregateRepresentation::with_stack(4, spec, stack(4, 5)).is_err());
        assert!(AggregateRepresentation::with_stack(4, spec, stack(5, 4)).is_err());
        assert!(AggregateRepresentation::with_stack(0, spec, stack(5, 1)).is_err());
    }

    #[test]
    fn construction_uses_configured_widths() {
        let mut config = AggregateConfig::new(6, GraphStateSpec::new(3, 4));
        config.set_hidden_sizes(vec![10]);
        config.set_dropout_keep(0.5);
        let model = AggregateRepresentation::new(&config, &mut StdRng::seed_from_u64(0)).unwrap();

        assert_eq!(model.stack().input_width(), 7);
        assert_eq!(model.stack().output_width(), 7);
        assert!(model.params().iter().all(|p| p.name.starts_with("aggregaterepr/")));
        // input slot off, hidden slot on, output slot on
        assert_eq!(model.stack().mask_layout(), vec![None, Some(10), Some(7)]);
    }
}
