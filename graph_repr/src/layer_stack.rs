use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::distr::{Distribution, Uniform};
use tracing::{debug, warn};

use crate::config::{LayerStackConfig, check_keep};
use crate::dropout::{DropoutMasks, MaskSource, apply_mask};
use crate::error::{GraphReprError, Result};

/// One affine map `y = x Wᵀ + b`, applied row-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    // out x in
    weights: DMatrix<f32>,
    // out x 1
    bias: DMatrix<f32>,
}

impl Linear {
    pub fn zeros(input_width: usize, output_width: usize) -> Self {
        Self {
            weights: DMatrix::zeros(output_width, input_width),
            bias: DMatrix::zeros(output_width, 1),
        }
    }

    /// `weights` is `output_width x input_width`.
    pub fn from_parts(weights: DMatrix<f32>, bias: DVector<f32>) -> Result<Self> {
        if bias.len() != weights.nrows() {
            return Err(GraphReprError::WidthMismatch {
                what: "bias length",
                expected: weights.nrows(),
                actual: bias.len(),
            });
        }
        let bias = DMatrix::from_column_slice(bias.len(), 1, bias.as_slice());
        Ok(Self { weights, bias })
    }

    /// Glorot-uniform weights, zero bias.
    pub fn glorot<R: Rng + ?Sized>(
        input_width: usize,
        output_width: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let limit = (6.0 / (input_width + output_width) as f32).sqrt();
        let uniform = Uniform::new_inclusive(-limit, limit)
            .map_err(|e| GraphReprError::InvalidConfig(format!("glorot init: {e}")))?;
        Ok(Self {
            weights: DMatrix::from_fn(output_width, input_width, |_, _| {
                uniform.sample(&mut *rng)
            }),
            bias: DMatrix::zeros(output_width, 1),
        })
    }

    pub fn input_width(&self) -> usize {
        self.weights.ncols()
    }

    pub fn output_width(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &DMatrix<f32> {
        &self.weights
    }

    pub fn bias(&self) -> &DMatrix<f32> {
        &self.bias
    }

    pub fn forward(&self, x: &DMatrix<f32>) -> DMatrix<f32> {
        let mut y = x * self.weights.transpose();
        for (mut column, &b) in y.column_iter_mut().zip(self.bias.iter()) {
            column.add_scalar_mut(b);
        }
        y
    }
}

/// A named, borrowed learnable tensor.
#[derive(Debug)]
pub struct Param<'a> {
    pub name: String,
    pub value: &'a DMatrix<f32>,
}

#[derive(Debug)]
pub struct ParamMut<'a> {
    pub name: String,
    pub value: &'a mut DMatrix<f32>,
}

/// Affine layers with ReLU between them and dropout at configurable slots.
///
/// Slot `i < layers` is the input of layer `i`; slot `layers` is the stack
/// output. The input slot takes dropout when `dropout_input` is set, hidden
/// slots always do, and the output slot does when `dropout_output` is set.
/// A keep probability of 1 disables every slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerStack {
    name: String,
    linears: Vec<Linear>,
    dropout_keep: f32,
    dropout_input: bool,
    dropout_output: bool,
}

impl LayerStack {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        config: &LayerStackConfig,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;

        let mut linears = Vec::new();
        for w in config.widths().windows(2) {
            linears.push(Linear::glorot(w[0], w[1], rng)?);
        }
        debug!(
            stack = name,
            widths = ?config.widths(),
            dropout_keep = config.dropout_keep,
            "built layer stack"
        );

        Ok(Self {
            name: name.to_string(),
            linears,
            dropout_keep: config.dropout_keep,
            dropout_input: config.dropout_input,
            dropout_output: config.dropout_output,
        })
    }

    /// Assembles a stack from explicit layers, checking that widths chain.
    pub fn from_layers(
        name: &str,
        linears: Vec<Linear>,
        dropout_keep: f32,
        dropout_input: bool,
        dropout_output: bool,
    ) -> Result<Self> {
        if linears.is_empty() {
            return Err(GraphReprError::InvalidConfig(format!(
                "layer stack {name} has no layers"
            )));
        }
        for pair in linears.windows(2) {
            if pair[0].output_width() != pair[1].input_width() {
                return Err(GraphReprError::WidthMismatch {
                    what: "consecutive layer widths",
                    expected: pair[0].output_width(),
                    actual: pair[1].input_width(),
                });
            }
        }
        check_keep(dropout_keep)?;

        Ok(Self {
            name: name.to_string(),
            linears,
            dropout_keep,
            dropout_input,
            dropout_output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Linear] {
        &self.linears
    }

    pub fn input_width(&self) -> usize {
        self.linears.first().map_or(0, Linear::input_width)
    }

    pub fn output_width(&self) -> usize {
        self.linears.last().map_or(0, Linear::output_width)
    }

    pub fn params(&self) -> Vec<Param<'_>> {
        let mut params = Vec::with_capacity(2 * self.linears.len());
        for (i, linear) in self.linears.iter().enumerate() {
            params.push(Param {
                name: format!("{}/layer{}/W", self.name, i),
                value: &linear.weights,
            });
            params.push(Param {
                name: format!("{}/layer{}/b", self.name, i),
                value: &linear.bias,
            });
        }
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = Vec::with_capacity(2 * self.linears.len());
        for (i, linear) in self.linears.iter_mut().enumerate() {
            params.push(ParamMut {
                name: format!("{}/layer{}/W", self.name, i),
                value: &mut linear.weights,
            });
            params.push(ParamMut {
                name: format!("{}/layer{}/b", self.name, i),
                value: &mut linear.bias,
            });
        }
        params
    }

    /// Total number of learnable scalars.
    pub fn num_params(&self) -> usize {
        self.linears
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    /// `Some(width)` for every slot that takes dropout.
    pub fn mask_layout(&self) -> Vec<Option<usize>> {
        let last = self.linears.len();
        let mut layout = Vec::with_capacity(last + 1);
        for i in 0..=last {
            let width = match self.linears.get(i) {
                Some(linear) => linear.input_width(),
                None => self.output_width(),
            };
            let enabled = self.dropout_keep < 1.0
                && match i {
                    0 => self.dropout_input,
                    i if i == last => self.dropout_output,
                    _ => true,
                };
            layout.push(enabled.then_some(width));
        }
        layout
    }

    pub fn dropout_masks<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<DropoutMasks> {
        DropoutMasks::sample(&self.mask_layout(), self.dropout_keep, rng)
    }

    /// Runs every row of `flat_input` through the stack and returns the
    /// output along with the masks that were applied.
    pub fn process(
        &self,
        flat_input: &DMatrix<f32>,
        masks: MaskSource<'_>,
    ) -> Result<(DMatrix<f32>, DropoutMasks)> {
        self.check_input(flat_input)?;
        let masks = match masks {
            MaskSource::Sample(rng) => self.dropout_masks(rng)?,
            MaskSource::Reuse(masks) => {
                if let Err(e) = masks.check_layout(&self.mask_layout()) {
                    warn!(stack = %self.name, error = %e, "rejecting dropout masks");
                    return Err(e);
                }
                masks.clone()
            }
        };
        let output = self.forward(flat_input, &masks);
        Ok((output, masks))
    }

    /// Forward pass with dropout disabled.
    pub fn process_eval(&self, flat_input: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        self.check_input(flat_input)?;
        Ok(self.forward(flat_input, &DropoutMasks::none(self.linears.len() + 1)))
    }

    fn check_input(&self, flat_input: &DMatrix<f32>) -> Result<()> {
        if flat_input.ncols() != self.input_width() {
            warn!(
                stack = %self.name,
                expected = self.input_width(),
                actual = flat_input.ncols(),
                "rejecting stack input"
            );
            return Err(GraphReprError::WidthMismatch {
                what: "stack input width",
                expected: self.input_width(),
                actual: flat_input.ncols(),
            });
        }
        Ok(())
    }

    fn forward(&self, input: &DMatrix<f32>, masks: &DropoutMasks) -> DMatrix<f32> {
        let mut x = input.clone();
        for i in 0..self.linears.len() {
            if let Some(mask) = masks.get(i) {
                apply_mask(&mut x, mask);
            }
            x = self.linears[i].forward(&x);
            if i + 1 != self.linears.len() {
                x.apply(|v| *v = v.max(0.0));
            }
        }
        if let Some(mask) = masks.get(self.linears.len()) {
            apply_mask(&mut x, mask);
        }
        x
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn two_layer() -> LayerStack {
        // 2 -> 2 -> 1, hidden ReLU
        let hidden = Linear::from_parts(
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]),
            DVector::from_vec(vec![0.0, 0.5]),
        )
        .unwrap();
        let out = Linear::from_parts(
            DMatrix::from_row_slice(1, 2, &[2.0, 3.0]),
            DVector::from_vec(vec![-1.0]),
        )
        .unwrap();
        LayerStack::from_layers("test", vec![hidden, out], 0.5, false, true).unwrap()
    }

    #[test]
    fn linear_forward_is_affine_per_row() {
        let linear = Linear::from_parts(
            DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 0.0, -1.0, 0.0]),
            DVector::from_vec(vec![0.5, 1.0]),
        )
        .unwrap();
        let x = DMatrix::from_row_slice(2, 3, &[1.0, 1.0, 1.0, 0.0, 2.0, 0.0]);
        let y = linear.forward(&x);
        assert_eq!(y, DMatrix::from_row_slice(2, 2, &[6.5, 0.0, 4.5, -1.0]));
    }

    #[test]
    fn hidden_layers_apply_relu() {
        let stack = two_layer();
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, -1.0, -2.0]);
        let y = stack.process_eval(&x).unwrap();
        // row 0: hidden (1, -1.5) -> relu (1, 0) -> 2 - 1 = 1
        // row 1: hidden (-1, 2.5) -> relu (0, 2.5) -> 7.5 - 1 = 6.5
        assert_eq!(y, DMatrix::from_row_slice(2, 1, &[1.0, 6.5]));
    }

    #[test]
    fn mask_layout_follows_flags() {
        let stack = two_layer();
        assert_eq!(stack.mask_layout(), vec![None, Some(2), Some(1)]);

        let no_dropout = LayerStack::from_layers(
            "test",
            stack.layers().to_vec(),
            1.0,
            true,
            true,
        )
        .unwrap();
        assert_eq!(no_dropout.mask_layout(), vec![None, None, None]);
    }

    #[test]
    fn reused_masks_give_identical_output() {
        let stack = two_layer();
        let mut rng = StdRng::seed_from_u64(5);
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, -1.0, -2.0]);

        let (first, masks) = stack.process(&x, MaskSource::Sample(&mut rng)).unwrap();
        let (second, reused) = stack.process(&x, MaskSource::Reuse(&masks)).unwrap();
        assert_eq!(first, second);
        assert_eq!(masks, reused);
    }

    #[test]
    fn process_rejects_bad_input_and_masks() {
        let stack = two_layer();
        let x = DMatrix::zeros(4, 3);
        assert!(matches!(
            stack.process_eval(&x),
            Err(GraphReprError::WidthMismatch { .. })
        ));

        let x = DMatrix::zeros(4, 2);
        let wrong = DropoutMasks::none(3);
        assert!(matches!(
            stack.process(&x, MaskSource::Reuse(&wrong)),
            Err(GraphReprError::MaskMismatch(_))
        ));
    }

    #[test]
    fn from_layers_checks_widths_and_keep() {
        let a = Linear::zeros(3, 4);
        let b = Linear::zeros(5, 2);
        assert!(LayerStack::from_layers("s", vec![a.clone(), b], 1.0, false, false).is_err());
        assert!(LayerStack::from_layers("s", vec![], 1.0, false, false).is_err());
        assert!(LayerStack::from_layers("s", vec![a], 0.0, false, false).is_err());
    }

    #[test]
    fn params_are_named_per_layer() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut config = LayerStackConfig::new(6, 3);
        config.hidden_sizes = vec![4];
        let mut stack = LayerStack::new("proj", &config, &mut rng).unwrap();

        let names: Vec<String> = stack.params().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["proj/layer0/W", "proj/layer0/b", "proj/layer1/W", "proj/layer1/b"]
        );
        assert_eq!(stack.num_params(), 6 * 4 + 4 + 4 * 3 + 3);

        let limit = (6.0f32 / 10.0).sqrt();
        assert!(stack.params()[0].value.iter().all(|w| w.abs() <= limit));
        assert!(stack.params()[1].value.iter().all(|&b| b == 0.0));

        for param in stack.params_mut() {
            param.value.fill(0.0);
        }
        let y = stack.process_eval(&DMatrix::from_element(2, 6, 1.0)).unwrap();
        assert_eq!(y, DMatrix::zeros(2, 3));
    }
}
