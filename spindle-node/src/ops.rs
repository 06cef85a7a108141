//! Demo kernels: a ball-end cutter dropped onto a sampled height field.

use serde::{Deserialize, Serialize};
use spindle::{
    cache::{CacheRef, Cacheable},
    operation::{Operation, OperationError, Result},
    RemoteExecute,
};

/// A regular grid of heights, `spacing` apart on both axes.
///
/// Shared by every task of a batch, so it is passed with
/// [`Arg::shared`](spindle::task::Arg::shared) and transferred once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeightField {
    pub id: String,
    pub spacing: f64,
    pub columns: usize,
    pub heights: Vec<f64>,
}

impl Cacheable for HeightField {
    fn cache_ref(&self) -> CacheRef {
        CacheRef::new(format!("height-field-{}", self.id))
    }
}

impl HeightField {
    /// A gentle sine ridge, `columns` by `rows` samples.
    pub fn ridge(id: impl Into<String>, columns: usize, rows: usize, spacing: f64) -> Self {
        let heights = (0..rows)
            .flat_map(|row| {
                (0..columns).map(move |column| {
                    let x = column as f64 * spacing;
                    let y = row as f64 * spacing;
                    (x * 0.3).sin() + (y * 0.2).cos()
                })
            })
            .collect();

        Self {
            id: id.into(),
            spacing,
            columns,
            heights,
        }
    }

    pub fn rows(&self) -> usize {
        self.heights.len().checked_div(self.columns).unwrap_or(0)
    }

    /// Samples within `radius` of `(x, y)`, as `(distance², z)`.
    fn samples_near(&self, x: f64, y: f64, radius: f64) -> impl Iterator<Item = (f64, f64)> + '_ {
        let first = |c: f64| ((c - radius) / self.spacing).floor().max(0.0) as usize;
        let last = |c: f64, len: usize| {
            (((c + radius) / self.spacing).ceil().max(0.0) as usize).min(len.saturating_sub(1))
        };
        let (columns, rows) = (first(x)..=last(x, self.columns), first(y)..=last(y, self.rows()));

        rows.flat_map(move |row| columns.clone().map(move |column| (row, column)))
            .filter_map(move |(row, column)| {
                let z = *self.heights.get(row * self.columns + column)?;
                let dx = column as f64 * self.spacing - x;
                let dy = row as f64 * self.spacing - y;
                let distance = dx * dx + dy * dy;
                (distance <= radius * radius).then_some((distance, z))
            })
    }
}

/// Lowest height the tip of a ball-end cutter can reach at `(x, y)` without
/// gouging the height field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, RemoteExecute)]
pub struct DropCutter {
    pub radius: f64,
}

impl Operation for DropCutter {
    type Input = (HeightField, (f64, f64));
    type Output = f64;

    fn execute(&self, (field, (x, y)): Self::Input) -> Result<Self::Output> {
        if self.radius <= 0.0 {
            return Err(OperationError::fatal_str("cutter radius must be positive"));
        }

        field
            .samples_near(x, y, self.radius)
            .map(|(distance, z)| z + (self.radius * self.radius - distance).sqrt() - self.radius)
            .reduce(f64::max)
            .ok_or_else(|| {
                OperationError::fatal(anyhow::anyhow!(
                    "cutter at ({x}, {y}) does not touch the height field"
                ))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flat(z: f64) -> HeightField {
        HeightField {
            id: "flat".into(),
            spacing: 1.0,
            columns: 4,
            heights: vec![z; 16],
        }
    }

    #[test]
    fn tip_rests_on_a_flat_floor() {
        let z = DropCutter { radius: 2.0 }
            .execute((flat(1.5), (1.0, 1.0)))
            .unwrap();
        assert!((z - 1.5).abs() < 1e-9);
    }

    #[test]
    fn a_single_peak_lifts_the_cutter() {
        let mut field = flat(0.0);
        field.heights[5] = 3.0; // (1, 1)

        let cutter = DropCutter { radius: 1.0 };
        let above = cutter.execute((field.clone(), (1.0, 1.0))).unwrap();
        assert!((above - 3.0).abs() < 1e-9);

        // Half a radius away the ball touches the peak on its flank.
        let beside = cutter.execute((field, (1.5, 1.0))).unwrap();
        let expected = 3.0 + (1.0_f64 - 0.25).sqrt() - 1.0;
        assert!((beside - expected).abs() < 1e-9);
    }

    #[test]
    fn cutter_outside_the_field_fails() {
        let err = DropCutter { radius: 0.5 }
            .execute((flat(0.0), (20.0, 20.0)))
            .unwrap_err();
        assert!(err.to_string().contains("does not touch"));
    }

    #[test]
    fn ridge_has_the_requested_shape() {
        let field = HeightField::ridge("demo", 8, 5, 0.5);
        assert_eq!(field.heights.len(), 40);
        assert_eq!(field.rows(), 5);
        assert_eq!(field.cache_ref(), CacheRef::new("height-field-demo"));
    }
}
