use graph_repr::{AggregateConfig, AggregateRepresentation, GraphState, GraphStateSpec};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::info;
use tracing_subscriber::EnvFilter;

const NUM_NODE_IDS: usize = 4;
const NODE_STATE_SIZE: usize = 8;
const REPRESENTATION_WIDTH: usize = 16;

/// A batch of graphs whose later node slots are absent, so each graph has a
/// different effective size.
fn synthetic_batch(
    spec: GraphStateSpec,
    n_batch: usize,
    n_nodes: usize,
    rng: &mut StdRng,
) -> Result<GraphState, Box<dyn std::error::Error>> {
    let normal = Normal::new(0.0f32, 1.0)?;
    let mut state = GraphState::zeros(spec, n_batch, n_nodes)?;
    for graph in 0..n_batch {
        let present = rng.random_range(0..=n_nodes);
        for node in 0..n_nodes {
            let mut ids = vec![0.0f32; spec.num_node_ids()];
            ids[node % spec.num_node_ids()] = 1.0;
            let node_state: Vec<f32> = (0..spec.node_state_size())
                .map(|_| normal.sample(&mut *rng))
                .collect();
            let strength = if node < present {
                rng.random_range(0.5..=1.0)
            } else {
                0.0
            };
            state.set_node(graph, node, &ids, &node_state, strength)?;
        }
    }
    Ok(state)
}

fn row_norms(m: &DMatrix<f32>) -> Vec<f32> {
    m.row_iter().map(|r| r.norm()).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut rng = StdRng::seed_from_u64(42);
    let spec = GraphStateSpec::new(NUM_NODE_IDS, NODE_STATE_SIZE);

    let mut config = AggregateConfig::new(REPRESENTATION_WIDTH, spec);
    config.set_hidden_sizes(vec![32]);
    config.set_dropout_keep(0.8);
    let model = AggregateRepresentation::new(&config, &mut rng)?;
    let num_params: usize = model.params().iter().map(|p| p.value.len()).sum();
    info!(num_params, "model ready");

    let state = synthetic_batch(spec, 4, 6, &mut rng)?;

    // Evaluation: no dropout
    let eval = model.process_eval(&state)?;
    info!(norms = ?row_norms(&eval), "eval representations");

    // Training-style pass that keeps its masks, then a second pass over a
    // different batch reusing them.
    let (train, masks) = model.process_sampled(&state, &mut rng)?;
    info!(norms = ?row_norms(&train), "dropout representations");

    let next = synthetic_batch(spec, 2, 9, &mut rng)?;
    let (reused, _) = model.process_with_masks(&next, &masks)?;
    info!(norms = ?row_norms(&reused), "representations with shared masks");

    let (again, _) = model.process_with_masks(&state, &masks)?;
    info!(identical = (again == train), "replayed masked pass");

    Ok(())
}
