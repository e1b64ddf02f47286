//! Orthonormal real 2D Fourier transforms on an `M × N` grid.
//!
//! Spectra are stored row-major as `M × (N/2 + 1)` complex values (the
//! non-negative frequencies of the last axis). Both directions are scaled by
//! `1/√(MN)` so that `irfft2(rfft2(x)) == x`. The adjoints are exact with
//! respect to the real inner product `⟨a, b⟩ = Σ Re(a)Re(b) + Im(a)Im(b)`,
//! which is what the backward pass of the spectral operator needs.

use num_complex::Complex;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

#[derive(Clone)]
pub struct SpectralPlan {
    height: usize,
    width: usize,
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
    scale: f64,
}

impl std::fmt::Debug for SpectralPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralPlan")
            .field("height", &self.height)
            .field("width", &self.width)
            .finish()
    }
}

impl SpectralPlan {
    pub fn new(height: usize, width: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            height,
            width,
            row_forward: planner.plan_fft_forward(width),
            row_inverse: planner.plan_fft_inverse(width),
            col_forward: planner.plan_fft_forward(height),
            col_inverse: planner.plan_fft_inverse(height),
            scale: 1.0 / ((height * width) as f64).sqrt(),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of retained columns in a half spectrum.
    pub fn half_width(&self) -> usize {
        self.width / 2 + 1
    }

    pub fn spectrum_len(&self) -> usize {
        self.height * self.half_width()
    }

    /// Forward transform of a row-major `M × N` real grid.
    pub fn rfft2(&self, x: &[f64]) -> Vec<Complex<f64>> {
        debug_assert_eq!(x.len(), self.height * self.width);
        let half = self.half_width();
        let mut spectrum = vec![Complex::<f64>::zero(); self.spectrum_len()];
        let mut row = vec![Complex::<f64>::zero(); self.width];
        for i in 0..self.height {
            for (slot, &v) in row.iter_mut().zip(&x[i * self.width..(i + 1) * self.width]) {
                *slot = Complex::new(v, 0.0);
            }
            self.row_forward.process(&mut row);
            spectrum[i * half..(i + 1) * half].copy_from_slice(&row[..half]);
        }
        self.process_columns(&mut spectrum, self.col_forward.as_ref());
        spectrum.iter_mut().for_each(|v| *v *= self.scale);
        spectrum
    }

    /// Inverse transform of a half spectrum. Imaginary parts of the zero and
    /// Nyquist columns do not contribute, matching a complex-to-real FFT.
    pub fn irfft2(&self, spectrum: &[Complex<f64>]) -> Vec<f64> {
        debug_assert_eq!(spectrum.len(), self.spectrum_len());
        let half = self.half_width();
        let mut work = spectrum.to_vec();
        self.process_columns(&mut work, self.col_inverse.as_ref());

        let mut out = vec![0.0; self.height * self.width];
        let mut row = vec![Complex::<f64>::zero(); self.width];
        for i in 0..self.height {
            let source = &work[i * half..(i + 1) * half];
            for k in 0..self.width {
                row[k] = if k < half {
                    source[k]
                } else {
                    source[self.width - k].conj()
                };
            }
            row[0].im = 0.0;
            if self.width % 2 == 0 {
                row[self.width / 2].im = 0.0;
            }
            self.row_inverse.process(&mut row);
            for (slot, v) in out[i * self.width..(i + 1) * self.width].iter_mut().zip(&row) {
                *slot = v.re * self.scale;
            }
        }
        out
    }

    /// Adjoint of [`SpectralPlan::rfft2`]: maps a spectrum gradient back to
    /// the grid.
    pub fn rfft2_adjoint(&self, grad: &[Complex<f64>]) -> Vec<f64> {
        debug_assert_eq!(grad.len(), self.spectrum_len());
        let half = self.half_width();
        let mut work = grad.to_vec();
        self.process_columns(&mut work, self.col_inverse.as_ref());

        let mut out = vec![0.0; self.height * self.width];
        let mut row = vec![Complex::<f64>::zero(); self.width];
        for i in 0..self.height {
            row.iter_mut().for_each(|v| *v = Complex::zero());
            row[..half].copy_from_slice(&work[i * half..(i + 1) * half]);
            self.row_inverse.process(&mut row);
            for (slot, v) in out[i * self.width..(i + 1) * self.width].iter_mut().zip(&row) {
                *slot = v.re * self.scale;
            }
        }
        out
    }

    /// Adjoint of [`SpectralPlan::irfft2`]: maps a grid gradient to a
    /// spectrum gradient.
    pub fn irfft2_adjoint(&self, grad: &[f64]) -> Vec<Complex<f64>> {
        debug_assert_eq!(grad.len(), self.height * self.width);
        let half = self.half_width();
        let mut spectrum = vec![Complex::<f64>::zero(); self.spectrum_len()];
        let mut row = vec![Complex::<f64>::zero(); self.width];
        for i in 0..self.height {
            for (slot, &v) in row.iter_mut().zip(&grad[i * self.width..(i + 1) * self.width]) {
                *slot = Complex::new(v, 0.0);
            }
            self.row_forward.process(&mut row);
            for k in 0..half {
                let self_conjugate = k == 0 || (self.width % 2 == 0 && k == self.width / 2);
                spectrum[i * half + k] = if self_conjugate {
                    Complex::new(row[k].re, 0.0)
                } else {
                    row[k] * 2.0
                };
            }
        }
        self.process_columns(&mut spectrum, self.col_forward.as_ref());
        spectrum.iter_mut().for_each(|v| *v *= self.scale);
        spectrum
    }

    fn process_columns(&self, spectrum: &mut [Complex<f64>], fft: &dyn Fft<f64>) {
        let half = self.half_width();
        let mut column = vec![Complex::<f64>::zero(); self.height];
        for q in 0..half {
            for (p, slot) in column.iter_mut().enumerate() {
                *slot = spectrum[p * half + q];
            }
            fft.process(&mut column);
            for (p, v) in column.iter().enumerate() {
                spectrum[p * half + q] = *v;
            }
        }
    }
}
