//! Conversion of raw IQ samples to DC-free complex floats.

use num_complex::Complex32;

use crate::IqSample;

/// Pole of the DC blocker.
pub const ALPHA: f32 = 0.9996;

/// First order recursive DC blocker applied to I and Q independently.
///
/// ```text
/// y[n] = x[n] - x[n-1] + α·y[n-1]
/// ```
///
/// See [Julius O. Smith's notes][1] on DC blockers.
///
/// [1]: https://ccrma.stanford.edu/~jos/filters/DC_Blocker.html
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DcBlocker {
    x_prev: Complex32,
    y_prev: Complex32,
}

impl DcBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, x: Complex32) -> Complex32 {
        let y = x - self.x_prev + self.y_prev * ALPHA;
        self.x_prev = x;
        self.y_prev = y;
        y
    }

    /// Converts raw samples and appends the filtered result to `output`.
    ///
    /// The filter state carries over to the next call.
    pub fn process_raw(&mut self, input: &[IqSample], output: &mut Vec<Complex32>) {
        output.extend(input.iter().map(|sample| self.process(normalize(*sample))));
    }
}

/// Maps an unsigned 8 bit sample to roughly `[-1, 1]`.
pub fn normalize(sample: IqSample) -> Complex32 {
    #[inline(always)]
    fn component(x: u8) -> f32 {
        (i32::from(x) - 127) as f32 / 127.0
    }

    Complex32::new(component(sample.i), component(sample.q))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use num_complex::Complex32;

    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(normalize(IqSample { i: 127, q: 127 }), Complex32::new(0.0, 0.0));
        assert_eq!(normalize(IqSample { i: 254, q: 0 }), Complex32::new(1.0, -1.0));
        assert_relative_eq!(normalize(IqSample { i: 255, q: 0 }).re, 128.0 / 127.0);
    }

    #[test]
    fn first_sample_passes_through() {
        let mut filter = DcBlocker::new();
        let x = Complex32::new(0.5, -0.25);
        assert_eq!(filter.process(x), x);
    }

    #[test]
    fn recursion() {
        let mut filter = DcBlocker::new();
        let a = Complex32::new(1.0, 0.0);
        let b = Complex32::new(0.0, 1.0);
        filter.process(a);
        let y = filter.process(b);
        // b - a + α·a
        assert_relative_eq!(y.re, -1.0 + ALPHA);
        assert_relative_eq!(y.im, 1.0);
    }

    #[test]
    fn constant_input_decays_towards_zero() {
        let mut filter = DcBlocker::new();
        let raw = IqSample { i: 200, q: 60 };
        let input = vec![raw; 40_000];
        let mut output = Vec::new();
        filter.process_raw(&input, &mut output);

        let mut previous = f32::INFINITY;
        for y in &output {
            let magnitude = y.norm();
            assert!(magnitude <= previous);
            previous = magnitude;
        }
        // 0.9996^40000 ≈ 1e-7
        assert!(previous < 1e-3, "still at {previous}");
    }

    #[test]
    fn state_persists_across_blocks() {
        let input: Vec<IqSample> = (0..=255u8)
            .map(|i| IqSample { i, q: 255 - i })
            .collect();

        let mut whole = DcBlocker::new();
        let mut expected = Vec::new();
        whole.process_raw(&input, &mut expected);

        let mut split = DcBlocker::new();
        let mut output = Vec::new();
        for chunk in input.chunks(7) {
            split.process_raw(chunk, &mut output);
        }

        assert_eq!(output, expected);
        assert_eq!(split, whole);
    }
}
