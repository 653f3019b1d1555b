pub mod aggregate;
pub mod config;
pub mod dropout;
pub mod error;
pub mod graph_state;
pub mod layer_stack;

pub use aggregate::{AggregateRepresentation, NodeActivation};
pub use config::{AggregateConfig, LayerStackConfig};
pub use dropout::{DropoutMasks, MaskSource};
pub use error::{GraphReprError, Result};
pub use graph_state::{GraphState, GraphStateSpec};
pub use layer_stack::{LayerStack, Linear, Param, ParamMut};
