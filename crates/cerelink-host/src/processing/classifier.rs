//! Spectral seizure classifier.
//!
//! A pure function from one 178-sample window to a seizure decision:
//!
//! 1. Forward DFT over the window (no normalization).
//! 2. Magnitude spectrum for bins 1..=44, skipping DC.
//! 3. Linear decision function over the magnitudes with the trained
//!    [`super::weights`].
//!
//! The sign of the decision value is the label; its absolute value is the
//! confidence the hysteresis state machine accumulates.

use rustfft::{num_complex::Complex, FftPlanner};

use cerelink_core::types::{SeizureClassification, SPECTRUM_BINS, WINDOW_LEN};

use super::weights;

/// Classify one sample window.
///
/// Stateless: the same window always yields the same classification.
#[must_use]
pub fn classify(window: &[f64; WINDOW_LEN]) -> SeizureClassification {
    let mut buffer: Vec<Complex<f64>> = window
        .iter()
        .map(|&sample| Complex::new(sample, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(WINDOW_LEN);
    fft.process(&mut buffer);

    let mut spectrum = [0.0f64; SPECTRUM_BINS];
    for (bin, slot) in spectrum.iter_mut().enumerate() {
        let c = buffer[bin + 1];
        *slot = (c.re * c.re + c.im * c.im).sqrt();
    }

    let decision: f64 = weights::BIAS
        + spectrum
            .iter()
            .zip(weights::WEIGHTS.iter())
            .map(|(power, weight)| power * weight)
            .sum::<f64>();

    SeizureClassification {
        seizure: decision > 0.0,
        confidence: decision.abs() as f32,
        spectrum,
    }
}

// ============================================================================
// Tests
// ============================================================================
