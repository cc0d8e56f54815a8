//! Two-dimensional real-to-complex FFT
//!
//! The input is a row-major `height` x `width` real array; the output holds
//! only the non-redundant half of the spectrum, `height` rows of
//! `width / 2 + 1` complex bins, row-major. The transforms are unnormalized,
//! so a forward transform followed by a backward one scales the input by
//! `width * height`.

use std::sync::Arc;

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::error::TransformError;

pub struct RealFft2d {
    width: usize,
    height: usize,
    input: Vec<f64>,
    output: Vec<Complex64>,

    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    column_forward: Arc<dyn Fft<f64>>,
    column_inverse: Arc<dyn Fft<f64>>,

    row: Vec<Complex64>,
    column: Vec<Complex64>,
    spectrum: Vec<Complex64>,
    scratch: Vec<Complex64>,
}

impl RealFft2d {
    /// Plan transforms for a `width` x `height` input.
    pub fn new(width: usize, height: usize) -> Result<Self, TransformError> {
        if width == 0 || height == 0 {
            return Err(TransformError::InvalidDimensions { width, height });
        }

        let mut planner = FftPlanner::new();
        let row_forward = planner.plan_fft_forward(width);
        let row_inverse = planner.plan_fft_inverse(width);
        let column_forward = planner.plan_fft_forward(height);
        let column_inverse = planner.plan_fft_inverse(height);

        let scratch_len = [&row_forward, &row_inverse, &column_forward, &column_inverse]
            .iter()
            .map(|fft| fft.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);

        let zero = Complex64::new(0.0, 0.0);
        let output_len = height * (width / 2 + 1);

        Ok(Self {
            width,
            height,
            input: vec![0.0; width * height],
            output: vec![zero; output_len],
            row_forward,
            row_inverse,
            column_forward,
            column_inverse,
            row: vec![zero; width],
            column: vec![zero; height],
            spectrum: vec![zero; output_len],
            scratch: vec![zero; scratch_len],
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    /// `height * (width / 2 + 1)`
    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Load the real input, widening each sample to `f64` on the way.
    pub fn set_data_in<I>(&mut self, samples: I) -> Result<(), TransformError>
    where
        I: IntoIterator<Item = f64>,
        I::IntoIter: ExactSizeIterator,
    {
        let samples = samples.into_iter();
        if samples.len() != self.input.len() {
            return Err(TransformError::SizeMismatch {
                expected: self.input.len(),
                actual: samples.len(),
            });
        }

        for (slot, sample) in self.input.iter_mut().zip(samples) {
            *slot = sample;
        }
        Ok(())
    }

    pub fn input(&self) -> &[f64] {
        &self.input
    }

    pub fn output(&self) -> &[Complex64] {
        &self.output
    }

    /// Replace the half spectrum, e.g. before a backward transform.
    pub fn set_data_out(&mut self, spectrum: &[Complex64]) -> Result<(), TransformError> {
        if spectrum.len() != self.output.len() {
            return Err(TransformError::SizeMismatch {
                expected: self.output.len(),
                actual: spectrum.len(),
            });
        }
        self.output.copy_from_slice(spectrum);
        Ok(())
    }

    /// Input to output.
    pub fn transform_forward(&mut self) {
        let half = self.width / 2 + 1;

        for (input, output) in self
            .input
            .chunks_exact(self.width)
            .zip(self.output.chunks_exact_mut(half))
        {
            for (bin, &sample) in self.row.iter_mut().zip(input) {
                *bin = Complex64::new(sample, 0.0);
            }
            self.row_forward
                .process_with_scratch(&mut self.row, &mut self.scratch);
            output.copy_from_slice(&self.row[..half]);
        }

        for k in 0..half {
            for (r, bin) in self.column.iter_mut().enumerate() {
                *bin = self.output[r * half + k];
            }
            self.column_forward
                .process_with_scratch(&mut self.column, &mut self.scratch);
            for (r, bin) in self.column.iter().enumerate() {
                self.output[r * half + k] = *bin;
            }
        }
    }

    /// Output back to input, unnormalized. The output is left untouched.
    pub fn transform_backward(&mut self) {
        let half = self.width / 2 + 1;

        for k in 0..half {
            for (r, bin) in self.column.iter_mut().enumerate() {
                *bin = self.output[r * half + k];
            }
            self.column_inverse
                .process_with_scratch(&mut self.column, &mut self.scratch);
            for (r, bin) in self.column.iter().enumerate() {
                self.spectrum[r * half + k] = *bin;
            }
        }

        for (spectrum, input) in self
            .spectrum
            .chunks_exact(half)
            .zip(self.input.chunks_exact_mut(self.width))
        {
            // the upper half of each row follows from Hermitian symmetry
            for (k, bin) in self.row.iter_mut().enumerate() {
                *bin = if k < half {
                    spectrum[k]
                } else {
                    spectrum[self.width - k].conj()
                };
            }
            self.row_inverse
                .process_with_scratch(&mut self.row, &mut self.scratch);
            for (sample, bin) in input.iter_mut().zip(&self.row) {
                *sample = bin.re;
            }
        }
    }
}
