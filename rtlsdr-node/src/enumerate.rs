use std::ffi::CStr;

use crate::{
    Error,
    RtlSdr,
};

/// Returns an iterator over the attached RTL-SDRs.
pub fn devices() -> DeviceIter {
    let device_count = unsafe { rtlsdr_sys::rtlsdr_get_device_count() };
    tracing::debug!(device_count, "rtlsdr_get_device_count");

    DeviceIter {
        device_count,
        index: 0,
    }
}

/// Iterator over attached devices.
///
/// This yields [`DeviceInfo`]s.
#[derive(Clone, Copy, Debug)]
pub struct DeviceIter {
    device_count: u32,
    index: u32,
}

impl Iterator for DeviceIter {
    type Item = DeviceInfo;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.device_count {
            let index = self.index;
            self.index += 1;

            let device_name = unsafe { rtlsdr_sys::rtlsdr_get_device_name(index) };
            if device_name.is_null() {
                continue;
            }
            let device_name = unsafe { CStr::from_ptr(device_name) };
            if device_name.is_empty() {
                continue;
            }

            return Some(DeviceInfo { index, device_name });
        }

        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.device_count.saturating_sub(self.index);
        (0, usize::try_from(n).ok())
    }
}

/// An attached RTL-SDR that hasn't been opened yet.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    index: u32,
    device_name: &'static CStr,
}

impl DeviceInfo {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.to_str().ok()
    }

    /// Open the device
    pub fn open(&self) -> Result<RtlSdr, Error> {
        RtlSdr::open(self.index)
    }
}
