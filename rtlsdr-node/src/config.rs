/// Default size of a raw block read from the device, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 32 * 512;

/// librtlsdr transfers are multiples of this.
const BLOCK_GRANULARITY: usize = 512;

/// Settings shared by all devices of a [`Registry`][crate::Registry].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Size of raw blocks read from the device, in bytes. One block holds
    /// half as many samples.
    pub block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Config {
    /// Sets the block size, rounded up to a multiple of 512 bytes.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size
            .max(1)
            .div_ceil(BLOCK_GRANULARITY)
            .saturating_mul(BLOCK_GRANULARITY);
        self
    }
}
