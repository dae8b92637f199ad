/// Tuning context attached to every [`SampleBlock`][crate::SampleBlock].
///
/// `version` is bumped whenever the center frequency or sample rate of the
/// device changes, so the host can tell that blocks before and after a retune
/// don't belong together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Context {
    pub version: u64,
    pub center_frequency: i64,
    pub sample_rate: u32,
}

impl Context {
    pub(crate) fn new(center_frequency: i64, sample_rate: u32) -> Self {
        Self {
            version: 0,
            center_frequency,
            sample_rate,
        }
    }

    pub(crate) fn retune(&mut self, center_frequency: i64) {
        self.version += 1;
        self.center_frequency = center_frequency;
    }

    pub(crate) fn resample(&mut self, sample_rate: u32) {
        self.version += 1;
        self.sample_rate = sample_rate;
    }
}
