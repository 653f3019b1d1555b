use crate::error::{GraphReprError, Result};
use crate::graph_state::GraphStateSpec;

pub(crate) fn check_keep(dropout_keep: f32) -> Result<()> {
    if !(dropout_keep > 0.0 && dropout_keep <= 1.0) {
        return Err(GraphReprError::InvalidConfig(format!(
            "dropout_keep must be in (0, 1], got {dropout_keep}"
        )));
    }
    Ok(())
}

/// Shape and dropout settings for a [`crate::LayerStack`].
#[derive(Debug, Clone, PartialEq)]
pub struct LayerStackConfig {
    pub input_width: usize,
    pub output_width: usize,
    pub hidden_sizes: Vec<usize>,
    pub dropout_keep: f32,
    pub dropout_input: bool,
    pub dropout_output: bool,
}

impl LayerStackConfig {
    /// A single affine layer with dropout disabled.
    pub fn new(input_width: usize, output_width: usize) -> Self {
        Self {
            input_width,
            output_width,
            hidden_sizes: Vec::new(),
            dropout_keep: 1.0,
            dropout_input: false,
            dropout_output: false,
        }
    }

    /// Layer widths from input to output, inclusive.
    pub fn widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.hidden_sizes.len() + 2);
        widths.push(self.input_width);
        widths.extend_from_slice(&self.hidden_sizes);
        widths.push(self.output_width);
        widths
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(pos) = self.widths().iter().position(|&w| w == 0) {
            return Err(GraphReprError::InvalidConfig(format!(
                "layer width {pos} of {:?} is zero",
                self.widths()
            )));
        }
        check_keep(self.dropout_keep)
    }
}

/// Settings for [`crate::AggregateRepresentation`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    pub representation_width: usize,
    pub graph_spec: GraphStateSpec,
    pub dropout_keep: f32,
    pub dropout_output: bool,
    pub hidden_sizes: Vec<usize>,
}

impl AggregateConfig {
    pub fn new(representation_width: usize, graph_spec: GraphStateSpec) -> Self {
        Self {
            representation_width,
            graph_spec,
            dropout_keep: 1.0,
            dropout_output: true,
            hidden_sizes: Vec::new(),
        }
    }

    pub fn set_dropout_keep(&mut self, dropout_keep: f32) {
        self.dropout_keep = dropout_keep;
    }
    pub fn set_dropout_output(&mut self, dropout_output: bool) {
        self.dropout_output = dropout_output;
    }
    pub fn set_hidden_sizes(&mut self, hidden_sizes: Vec<usize>) {
        self.hidden_sizes = hidden_sizes;
    }

    /// The projection stack this aggregation needs: node features in, one
    /// gate logit plus `representation_width` content values out.
    pub fn stack_config(&self) -> LayerStackConfig {
        LayerStackConfig {
            input_width: self.graph_spec.feature_width(),
            output_width: self.representation_width + 1,
            hidden_sizes: self.hidden_sizes.clone(),
            dropout_keep: self.dropout_keep,
            dropout_input: false,
            dropout_output: self.dropout_output,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.representation_width == 0 {
            return Err(GraphReprError::InvalidConfig(
                "representation_width must be positive".into(),
            ));
        }
        if self.graph_spec.feature_width() == 0 {
            return Err(GraphReprError::InvalidConfig(
                "graph spec declares no node features".into(),
            ));
        }
        self.stack_config().validate()
    }
}
