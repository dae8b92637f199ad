//! Sample rate and gain calibration.
//!
//! Maps host requested sample rates and gains onto values the RTL2832U and its
//! tuner actually support, and holds the per tuner model frequency ranges.

use std::ops::RangeInclusive;

use crate::TunerType;

/// Sample rates offered to the host, in Hz.
pub const SAMPLE_RATES: [u32; 5] = [256_000, 1_000_000, 1_024_000, 2_000_000, 2_097_152];

/// Index into [`SAMPLE_RATES`] of the rate a device starts with.
pub const PREFERRED_SAMPLE_RATE_INDEX: usize = 2;

/// Highest sample rate we ever ask the hardware for.
pub const MAX_SAMPLE_RATE: u32 = 3_200_000;

/// Gain stages are reported with this name.
pub const GAIN_STAGE_NAME: &str = "RFGain";

/// Unit of the single gain stage.
pub const GAIN_STAGE_UNIT: &str = "dB";

pub fn preferred_sample_rate() -> u32 {
    SAMPLE_RATES[PREFERRED_SAMPLE_RATE_INDEX]
}

/// Maps a requested sample rate onto one the RTL2832U will accept.
///
/// The RTL2832U can't sample in `225_001..=300_000` and `900_001..3_200_000`
/// is only partially usable. Requests below the lower gap are raised to
/// 256 kHz, requests in the middle gap to 1 MHz and requests above the
/// maximum are capped. Everything else is passed through unchanged.
pub fn quantize_sample_rate(requested: u32) -> u32 {
    if requested < 225_001 {
        256_000
    }
    else if requested > 300_000 && requested < 900_000 {
        1_000_000
    }
    else if requested > MAX_SAMPLE_RATE {
        MAX_SAMPLE_RATE
    }
    else {
        requested
    }
}

/// Model name and tunable range of a tuner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunerInfo {
    pub name: &'static str,
    pub frequency_range: RangeInclusive<i64>,
}

impl TunerInfo {
    pub fn for_tuner(tuner_type: TunerType) -> Self {
        let (name, min, max) = match tuner_type {
            TunerType::E4000 => ("RTLE4000", 52_000_000, 2_200_000_000),
            TunerType::R820T => ("RTL820T", 24_000_000, 1_766_000_000),
            TunerType::R828D => ("RTL828D", 24_000_000, 1_766_000_000),
            TunerType::FC0013 => ("RTLFC13", 22_000_000, 1_100_000_000),
            TunerType::FC0012 => ("RTLFC12", 22_000_000, 948_000_000),
            TunerType::FC2580 => ("RTLFC2580", 146_000_000, 924_000_000),
            _ => ("RTLSDR", 70_000_000, 1_700_000_000),
        };
        Self {
            name,
            frequency_range: min..=max,
        }
    }

    /// Frequency a freshly opened device is tuned to.
    pub fn initial_frequency(&self) -> i64 {
        self.frequency_range.start() + 1_000_000
    }
}

/// Continuous gain range in dB.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GainRange {
    pub min: f32,
    pub max: f32,
}

impl GainRange {
    pub fn midpoint(&self) -> f32 {
        self.min + (self.max - self.min) / 2.0
    }
}

/// Discrete gain steps reported by the tuner, in tenths of a dB.
#[derive(Clone, Debug, Default)]
pub struct GainSteps {
    steps: Vec<i32>,
}

impl GainSteps {
    pub fn new(mut steps: Vec<i32>) -> Self {
        // librtlsdr reports them ascending already. the bracket search depends on it.
        steps.sort_unstable();
        Self { steps }
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.steps
    }

    fn positive(&self) -> &[i32] {
        let start = self.steps.partition_point(|step| *step <= 0);
        &self.steps[start..]
    }

    /// The continuous range spanned by the positive steps.
    ///
    /// Returns `None` if the tuner doesn't report any positive step.
    pub fn range(&self) -> Option<GainRange> {
        let positive = self.positive();
        let min = *positive.first()?;
        let max = *positive.last()?;
        Some(GainRange {
            min: min as f32 / 10.0,
            max: max as f32 / 10.0,
        })
    }

    /// Maps a gain in dB to the step the hardware is set to, in tenths of a
    /// dB.
    ///
    /// The gain is clamped into [`Self::range`] and then snapped down to the
    /// lower end of the first pair of adjacent steps enclosing it. This is
    /// intentionally not "nearest": the lower step is always chosen.
    pub fn snap(&self, gain: f32) -> Option<i32> {
        let positive = self.positive();
        let min = *positive.first()?;
        let max = *positive.last()?;

        // clamp in tenths, so the range ends map exactly onto their steps
        let tenths = ((gain * 10.0) as i32).clamp(min, max);
        let snapped = positive
            .windows(2)
            .find(|pair| pair[0] <= tenths && tenths <= pair[1])
            .map_or(tenths, |pair| pair[0]);
        Some(snapped)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn sample_rate_quantization() {
        assert_eq!(quantize_sample_rate(0), 256_000);
        assert_eq!(quantize_sample_rate(225_000), 256_000);
        assert_eq!(quantize_sample_rate(225_001), 225_001);
        assert_eq!(quantize_sample_rate(300_000), 300_000);
        assert_eq!(quantize_sample_rate(300_001), 1_000_000);
        assert_eq!(quantize_sample_rate(500_000), 1_000_000);
        assert_eq!(quantize_sample_rate(899_999), 1_000_000);
        assert_eq!(quantize_sample_rate(900_000), 900_000);
        assert_eq!(quantize_sample_rate(2_048_000), 2_048_000);
        assert_eq!(quantize_sample_rate(3_200_000), 3_200_000);
        assert_eq!(quantize_sample_rate(3_200_001), 3_200_000);
        assert_eq!(quantize_sample_rate(u32::MAX), 3_200_000);
    }

    #[test]
    fn sample_rate_quantization_is_idempotent() {
        for requested in (0..4_000_000).step_by(997) {
            let once = quantize_sample_rate(requested);
            assert_eq!(quantize_sample_rate(once), once, "requested {requested}");
        }
        for rate in SAMPLE_RATES {
            assert_eq!(quantize_sample_rate(rate), rate);
        }
    }

    #[test]
    fn preferred_rate_is_1024k() {
        assert_eq!(preferred_sample_rate(), 1_024_000);
    }

    #[test]
    fn gain_range_uses_positive_steps_only() {
        let steps = GainSteps::new(vec![-10, 0, 9, 14, 27, 496]);
        let range = steps.range().unwrap();
        assert_relative_eq!(range.min, 0.9);
        assert_relative_eq!(range.max, 49.6);
        assert_relative_eq!(range.midpoint(), 25.25, epsilon = 1e-4);
    }

    #[test]
    fn no_positive_steps_means_no_gain_range() {
        assert!(GainSteps::new(vec![]).range().is_none());
        assert!(GainSteps::new(vec![-40, 0]).range().is_none());
        assert!(GainSteps::new(vec![0]).snap(10.0).is_none());
    }

    #[test]
    fn gain_snaps_to_lower_bracket() {
        let steps = GainSteps::new(vec![0, 9, 20, 25, 30]);
        assert_eq!(steps.snap(1.5), Some(9));
        assert_eq!(steps.snap(2.4), Some(20));
        assert_eq!(steps.snap(2.0), Some(9));
        // the top step is enclosed by the last pair, so it snaps down too
        assert_eq!(steps.snap(3.0), Some(25));
    }

    #[test]
    fn gain_is_clamped_before_snapping() {
        let steps = GainSteps::new(vec![0, 9, 20, 25, 30]);
        assert_eq!(steps.snap(-5.0), Some(9));
        assert_eq!(steps.snap(0.5), Some(9));
        assert_eq!(steps.snap(100.0), Some(25));
        assert_eq!(steps.snap(f32::NAN), Some(9));
    }

    #[test]
    fn snapped_gain_is_a_step_within_range() {
        let steps = GainSteps::new(vec![
            0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338,
            364, 372, 386, 402, 421, 434, 439, 445, 480, 496,
        ]);
        let range = steps.range().unwrap();
        let mut gain = -10.0f32;
        while gain < 60.0 {
            let snapped = steps.snap(gain).unwrap();
            assert!(steps.as_slice().contains(&snapped), "gain {gain} -> {snapped}");
            let db = snapped as f32 / 10.0;
            assert!(db >= range.min && db <= range.max, "gain {gain} -> {db}");
            gain += 0.35;
        }
    }

    #[test]
    fn single_positive_step_is_left_unsnapped() {
        let steps = GainSteps::new(vec![0, 50]);
        assert_eq!(steps.snap(1.0), Some(50));
    }

    #[test]
    fn tuner_table() {
        let info = TunerInfo::for_tuner(TunerType::R820T);
        assert_eq!(info.name, "RTL820T");
        assert_eq!(info.frequency_range, 24_000_000..=1_766_000_000);
        assert_eq!(info.initial_frequency(), 25_000_000);

        let info = TunerInfo::for_tuner(TunerType::UNKNOWN);
        assert_eq!(info.name, "RTLSDR");
        assert_eq!(info.frequency_range, 70_000_000..=1_700_000_000);

        let info = TunerInfo::for_tuner(TunerType(42));
        assert_eq!(info.name, "RTLSDR");
    }
}
