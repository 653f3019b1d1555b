use nalgebra::{DMatrix, DVector};
use rand::distr::{Bernoulli, Distribution};
use rand::{Rng, RngCore};

use crate::error::{GraphReprError, Result};

/// Where a forward pass gets its dropout masks from.
pub enum MaskSource<'a> {
    /// Draw fresh masks from the caller's stream.
    Sample(&'a mut dyn RngCore),
    /// Reuse masks drawn earlier, e.g. to keep dropout consistent across
    /// time steps.
    Reuse(&'a DropoutMasks),
}

/// One optional inverted-dropout mask per stack slot.
///
/// Masks are per feature, so a set drawn for one batch applies to any other
/// batch or node count.
#[derive(Debug, Clone, PartialEq)]
pub struct DropoutMasks {
    masks: Vec<Option<DVector<f32>>>,
}

impl DropoutMasks {
    /// Every slot disabled.
    pub fn none(slots: usize) -> Self {
        Self {
            masks: vec![None; slots],
        }
    }

    pub fn from_masks(masks: Vec<Option<DVector<f32>>>) -> Self {
        Self { masks }
    }

    /// Draws a mask for every enabled slot of `layout`.
    ///
    /// `layout[i]` is `Some(width)` when slot `i` takes dropout.
    pub fn sample<R: Rng + ?Sized>(
        layout: &[Option<usize>],
        keep: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let mut masks = Vec::with_capacity(layout.len());
        for slot in layout {
            masks.push(match slot {
                Some(width) => Some(sample_mask(*width, keep, rng)?),
                None => None,
            });
        }
        Ok(Self { masks })
    }

    pub fn slots(&self) -> usize {
        self.masks.len()
    }

    pub fn get(&self, slot: usize) -> Option<&DVector<f32>> {
        self.masks.get(slot).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&DVector<f32>>> {
        self.masks.iter().map(Option::as_ref)
    }

    /// True when no slot carries a mask.
    pub fn is_empty(&self) -> bool {
        self.masks.iter().all(Option::is_none)
    }

    /// Fails unless this set has exactly the slots and widths of `layout`.
    pub fn check_layout(&self, layout: &[Option<usize>]) -> Result<()> {
        if self.masks.len() != layout.len() {
            return Err(GraphReprError::MaskMismatch(format!(
                "expected {} slots, got {}",
                layout.len(),
                self.masks.len()
            )));
        }
        for (slot, (mask, expected)) in self.masks.iter().zip(layout).enumerate() {
            match (mask, expected) {
                (None, None) => {}
                (Some(mask), Some(width)) if mask.len() == *width => {}
                (Some(mask), Some(width)) => {
                    return Err(GraphReprError::MaskMismatch(format!(
                        "slot {slot} expects width {width}, got {}",
                        mask.len()
                    )));
                }
                (Some(_), None) => {
                    return Err(GraphReprError::MaskMismatch(format!(
                        "slot {slot} has dropout disabled but a mask was supplied"
                    )));
                }
                (None, Some(_)) => {
                    return Err(GraphReprError::MaskMismatch(format!(
                        "slot {slot} has dropout enabled but no mask was supplied"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Inverted-dropout mask: each entry is `1 / keep` with probability `keep`,
/// otherwise 0.
pub fn sample_mask<R: Rng + ?Sized>(width: usize, keep: f32, rng: &mut R) -> Result<DVector<f32>> {
    if keep <= 0.0 {
        return Err(GraphReprError::InvalidConfig(format!(
            "dropout_keep must be positive, got {keep}"
        )));
    }
    let bernoulli = Bernoulli::new(f64::from(keep))
        .map_err(|e| GraphReprError::InvalidConfig(format!("dropout_keep {keep}: {e}")))?;
    let scale = 1.0 / keep;
    Ok(DVector::from_fn(width, |_, _| {
        if bernoulli.sample(&mut *rng) {
            scale
        } else {
            0.0
        }
    }))
}

/// Scales column `j` of `x` by `mask[j]`.
pub fn apply_mask(x: &mut DMatrix<f32>, mask: &DVector<f32>) {
    for (mut column, &m) in x.column_iter_mut().zip(mask.iter()) {
        column *= m;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn masks_hold_zero_or_inverse_keep() {
        let mut rng = StdRng::seed_from_u64(7);
        let mask = sample_mask(500, 0.25, &mut rng).unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || m == 4.0));

        let kept = mask.iter().filter(|&&m| m > 0.0).count();
        assert!((75..=175).contains(&kept), "kept {kept} of 500");
    }

    #[test]
    fn keep_of_one_never_drops() {
        let mut rng = StdRng::seed_from_u64(1);
        let mask = sample_mask(64, 1.0, &mut rng).unwrap();
        assert!(mask.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn sample_follows_layout() {
        let mut rng = StdRng::seed_from_u64(3);
        let layout = [None, Some(4), Some(2)];
        let masks = DropoutMasks::sample(&layout, 0.5, &mut rng).unwrap();
        assert_eq!(masks.slots(), 3);
        assert!(masks.get(0).is_none());
        assert_eq!(masks.get(1).map(|m| m.len()), Some(4));
        assert_eq!(masks.check_layout(&layout), Ok(()));
        assert!(!masks.is_empty());
        assert!(DropoutMasks::none(3).is_empty());
    }

    #[test]
    fn same_seed_same_masks() {
        let layout = [Some(16), Some(8)];
        let a = DropoutMasks::sample(&layout, 0.5, &mut StdRng::seed_from_u64(11)).unwrap();
        let b = DropoutMasks::sample(&layout, 0.5, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn check_layout_rejects_mismatches() {
        let layout = [None, Some(3)];
        let cases = [
            DropoutMasks::none(3),
            DropoutMasks::none(2),
            DropoutMasks::from_masks(vec![None, Some(DVector::from_element(2, 1.0))]),
            DropoutMasks::from_masks(vec![
                Some(DVector::from_element(3, 1.0)),
                Some(DVector::from_element(3, 1.0)),
            ]),
        ];
        for masks in cases {
            assert!(matches!(
                masks.check_layout(&layout),
                Err(GraphReprError::MaskMismatch(_))
            ));
        }
    }

    #[test]
    fn apply_mask_scales_columns() {
        let mut x = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        apply_mask(&mut x, &DVector::from_vec(vec![2.0, 0.0, 1.0]));
        assert_eq!(x, DMatrix::from_row_slice(2, 3, &[2.0, 0.0, 3.0, 8.0, 0.0, 6.0]));
    }
}
