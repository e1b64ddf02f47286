//! Batched multi-channel grid fields and the two-half latent state.
//!
//! A [`Field`] stores a `batch × height × width × channels` tensor as a
//! matrix with one row per grid cell and one column per channel, so that
//! per-cell linear layers are a single matrix product.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Spatial extent of a batch of 2D grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
}

impl GridShape {
    pub fn new(batch: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            height,
            width,
        }
    }

    pub fn cells_per_sample(&self) -> usize {
        self.height * self.width
    }

    pub fn cells(&self) -> usize {
        self.batch * self.cells_per_sample()
    }

    /// Row index of cell `(b, i, j)` in a field's value matrix.
    pub fn cell(&self, b: usize, i: usize, j: usize) -> usize {
        (b * self.height + i) * self.width + j
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    shape: GridShape,
    values: DMatrix<f64>,
}

impl Field {
    pub fn zeros(shape: GridShape, channels: usize) -> Self {
        Self {
            shape,
            values: DMatrix::zeros(shape.cells(), channels),
        }
    }

    pub fn from_fn<F>(shape: GridShape, channels: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize, usize) -> f64,
    {
        let mut values = DMatrix::zeros(shape.cells(), channels);
        for b in 0..shape.batch {
            for i in 0..shape.height {
                for j in 0..shape.width {
                    let row = shape.cell(b, i, j);
                    for c in 0..channels {
                        values[(row, c)] = f(b, i, j, c);
                    }
                }
            }
        }
        Self { shape, values }
    }

    /// Builds a field from values in `b m n c` (channel fastest) order.
    pub fn from_vec(shape: GridShape, channels: usize, data: Vec<f64>) -> Result<Self> {
        let expected = shape.cells() * channels;
        if data.len() != expected {
            bail!(
                "Field data length mismatch. Expected {} values for {:?} x {} channels, got {}.",
                expected,
                shape,
                channels,
                data.len()
            );
        }
        Ok(Self {
            shape,
            values: DMatrix::from_row_slice(shape.cells(), channels, &data),
        })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn channels(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.values
    }

    pub fn get(&self, b: usize, i: usize, j: usize, c: usize) -> f64 {
        self.values[(self.shape.cell(b, i, j), c)]
    }

    /// Values in `b m n c` order, the inverse of [`Field::from_vec`].
    pub fn to_vec(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.values.len());
        for row in 0..self.values.nrows() {
            out.extend(self.values.row(row).iter().copied());
        }
        out
    }

    /// Replaces the values while keeping the grid shape.
    pub(crate) fn with_values(&self, values: DMatrix<f64>) -> Self {
        debug_assert_eq!(values.nrows(), self.shape.cells());
        Self {
            shape: self.shape,
            values,
        }
    }

    pub fn same_layout(&self, other: &Field) -> bool {
        self.shape == other.shape && self.channels() == other.channels()
    }

    /// One channel as a column over every cell.
    pub fn channel(&self, c: usize) -> DVector<f64> {
        self.values.column(c).into_owned()
    }

    pub fn add(&self, other: &Field) -> Result<Field> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Field) -> Result<Field> {
        self.zip_with(other, "subtract", |a, b| a - b)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Field) -> Result<Field> {
        self.zip_with(other, "multiply", |a, b| a * b)
    }

    fn zip_with(&self, other: &Field, op: &str, f: impl Fn(f64, f64) -> f64) -> Result<Field> {
        if !self.same_layout(other) {
            bail!(
                "Cannot {} fields {:?} x {} and {:?} x {}.",
                op,
                self.shape,
                self.channels(),
                other.shape,
                other.channels()
            );
        }
        Ok(self.with_values(self.values.zip_map(&other.values, f)))
    }

    pub fn norm(&self) -> f64 {
        self.values.norm()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// DEQ latent state: the residual not yet explained (`backcast`) and the
/// accumulated prediction (`forecast`). Both halves share one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentState {
    pub backcast: Field,
    pub forecast: Field,
}

impl LatentState {
    pub fn new(backcast: Field, forecast: Field) -> Result<Self> {
        if !backcast.same_layout(&forecast) {
            bail!(
                "Latent halves differ in shape: backcast {:?} x {}, forecast {:?} x {}.",
                backcast.shape(),
                backcast.channels(),
                forecast.shape(),
                forecast.channels()
            );
        }
        Ok(Self { backcast, forecast })
    }

    pub fn zeros(shape: GridShape, channels: usize) -> Self {
        Self {
            backcast: Field::zeros(shape, channels),
            forecast: Field::zeros(shape, channels),
        }
    }

    pub fn shape(&self) -> GridShape {
        self.backcast.shape()
    }

    pub fn channels(&self) -> usize {
        self.backcast.channels()
    }

    /// Length of one packed sample: both halves of one grid.
    pub fn sample_len(&self) -> usize {
        2 * self.shape().cells_per_sample() * self.channels()
    }

    /// Packs the state into a `(2·height·width·channels) × batch` matrix.
    ///
    /// Rows of each column are ordered `(half, m, n, channel)`, half 0 being
    /// the backcast.
    pub fn to_columns(&self) -> DMatrix<f64> {
        let shape = self.shape();
        let channels = self.channels();
        let mut out = DMatrix::zeros(self.sample_len(), shape.batch);
        for (half, field) in [&self.backcast, &self.forecast].into_iter().enumerate() {
            for b in 0..shape.batch {
                for local in 0..shape.cells_per_sample() {
                    let row = b * shape.cells_per_sample() + local;
                    let base = (half * shape.cells_per_sample() + local) * channels;
                    for c in 0..channels {
                        out[(base + c, b)] = field.values[(row, c)];
                    }
                }
            }
        }
        out
    }

    pub fn from_columns(shape: GridShape, channels: usize, columns: &DMatrix<f64>) -> Result<Self> {
        let expected = 2 * shape.cells_per_sample() * channels;
        if columns.nrows() != expected || columns.ncols() != shape.batch {
            bail!(
                "Packed state is {}x{}, expected {}x{}.",
                columns.nrows(),
                columns.ncols(),
                expected,
                shape.batch
            );
        }
        Ok(Self::unpack(shape, channels, columns))
    }

    /// Unpacks a matrix already known to have the packed layout.
    pub(crate) fn unpack(shape: GridShape, channels: usize, columns: &DMatrix<f64>) -> Self {
        let mut halves = [Field::zeros(shape, channels), Field::zeros(shape, channels)];
        for (half, field) in halves.iter_mut().enumerate() {
            for b in 0..shape.batch {
                for local in 0..shape.cells_per_sample() {
                    let row = b * shape.cells_per_sample() + local;
                    let base = (half * shape.cells_per_sample() + local) * channels;
                    for c in 0..channels {
                        field.values[(row, c)] = columns[(base + c, b)];
                    }
                }
            }
        }
        let [backcast, forecast] = halves;
        Self { backcast, forecast }
    }

    pub fn norm(&self) -> f64 {
        (self.backcast.norm().powi(2) + self.forecast.norm().powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.backcast.is_finite() && self.forecast.is_finite()
    }
}
