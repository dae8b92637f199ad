use std::{
    ffi::{
        CStr,
        c_char,
        c_uchar,
        c_void,
    },
    panic::{
        AssertUnwindSafe,
        catch_unwind,
    },
    ptr::null_mut,
    slice,
};

use parking_lot::Mutex;

use crate::{
    Device,
    Error,
    TunerGainMode,
    TunerType,
};

/// An open RTL-SDR, accessed through librtlsdr.
///
/// Control operations are synchronized with a mutex. The blocking read and its
/// cancellation don't take it, so the device can be retuned while streaming.
#[derive(derive_more::Debug)]
pub struct RtlSdr {
    #[debug(skip)]
    handle: rtlsdr_sys::rtlsdr_dev_t,

    /// the tuner gain mode we set previously. we store this so we can skip
    /// setting it if we would set it to the same mode. librtlsdr doesn't do
    /// this check. initially we don't know the mode, so this is an Option.
    ///
    /// all control calls hold this lock.
    tuner_gain_mode: Mutex<Option<TunerGainMode>>,

    index: u32,
    tuner_type: TunerType,
    tuner_gains: Vec<i32>,
    serial: Option<String>,
}

// librtlsdr handles can be used from multiple threads. control calls are
// serialized by the mutex above.
unsafe impl Send for RtlSdr {}
unsafe impl Sync for RtlSdr {}

impl RtlSdr {
    pub fn open(index: u32) -> Result<Self, Error> {
        let mut handle: rtlsdr_sys::rtlsdr_dev_t = null_mut();
        let ret =
            unsafe { rtlsdr_sys::rtlsdr_open(&mut handle as *mut rtlsdr_sys::rtlsdr_dev_t, index) };
        tracing::debug!(?index, ?ret, "rtlsdr_open");
        if ret != 0 || handle.is_null() {
            return Err(Error::from_lib("rtlsdr_open", ret));
        }

        // from here on the device is closed by drop if anything fails.
        let mut device = Self {
            handle,
            tuner_gain_mode: Mutex::new(None),
            index,
            tuner_type: TunerType::UNKNOWN,
            tuner_gains: vec![],
            serial: None,
        };

        let ret: u32 = unsafe { rtlsdr_sys::rtlsdr_get_tuner_type(handle) } as u32;
        tracing::debug!(ret, "rtlsdr_get_tuner_type");
        if ret == 0 {
            tracing::warn!(index, "unknown tuner, assuming generic frequency range");
        }
        device.tuner_type = TunerType(ret);

        // ask for the number of gains first, then fetch them.
        let ret = unsafe { rtlsdr_sys::rtlsdr_get_tuner_gains(handle, null_mut()) };
        tracing::debug!(ret, "rtlsdr_get_tuner_gains");
        if let Ok(num_gains) = usize::try_from(ret) {
            let mut gains = vec![0; num_gains];
            let ret2 = unsafe { rtlsdr_sys::rtlsdr_get_tuner_gains(handle, gains.as_mut_ptr()) };
            if ret2 == ret {
                device.tuner_gains = gains;
            }
            else {
                tracing::warn!(ret, ret2, "rtlsdr_get_tuner_gains returned 2 different lengths");
            }
        }
        tracing::debug!(gains = ?device.tuner_gains, "rtlsdr_get_tuner_gains");

        let mut manufacturer = [0u8; 256];
        let mut product = [0u8; 256];
        let mut serial = [0u8; 256];
        let ret = unsafe {
            rtlsdr_sys::rtlsdr_get_usb_strings(
                handle,
                manufacturer.as_mut_ptr() as *mut c_char,
                product.as_mut_ptr() as *mut c_char,
                serial.as_mut_ptr() as *mut c_char,
            )
        };
        tracing::debug!(ret, "rtlsdr_get_usb_strings");
        if ret == 0 {
            device.serial = CStr::from_bytes_until_nul(&serial)
                .ok()
                .and_then(|serial| serial.to_str().ok())
                .filter(|serial| !serial.is_empty())
                .map(ToOwned::to_owned);
        }

        Ok(device)
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for RtlSdr {
    fn drop(&mut self) {
        tracing::debug!(index = self.index, "rtlsdr_close");
        let _guard = self.tuner_gain_mode.lock();
        unsafe {
            rtlsdr_sys::rtlsdr_close(self.handle);
        }
    }
}

impl Device for RtlSdr {
    fn tuner_type(&self) -> TunerType {
        self.tuner_type
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }

    fn tuner_gains(&self) -> Vec<i32> {
        self.tuner_gains.clone()
    }

    fn get_center_frequency(&self) -> Result<u32, Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_get_center_freq(self.handle) };
        tracing::debug!(ret, "rtlsdr_get_center_freq");
        if ret == 0 {
            Err(Error::from_lib("rtlsdr_get_center_freq", 0))
        }
        else {
            Ok(ret)
        }
    }

    fn set_center_frequency(&self, frequency: u32) -> Result<(), Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_set_center_freq(self.handle, frequency) };
        tracing::debug!(ret, frequency, "rtlsdr_set_center_freq");
        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_set_center_freq", ret))
        }
    }

    fn get_sample_rate(&self) -> Result<u32, Error> {
        // this gives us dev->rate, which is 0 if the sample rate hasn't been set yet.
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_get_sample_rate(self.handle) };
        tracing::trace!(ret, "rtlsdr_get_sample_rate");
        if ret != 0 {
            Ok(ret)
        }
        else {
            Err(Error::from_lib("rtlsdr_get_sample_rate", 0))
        }
    }

    fn set_sample_rate(&self, sample_rate: u32) -> Result<(), Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_set_sample_rate(self.handle, sample_rate) };
        tracing::debug!(ret, sample_rate, "rtlsdr_set_sample_rate");
        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_set_sample_rate", ret))
        }
    }

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<(), Error> {
        let mut current = self.tuner_gain_mode.lock();
        if *current == Some(mode) {
            return Ok(());
        }

        let ret = unsafe {
            rtlsdr_sys::rtlsdr_set_tuner_gain_mode(
                self.handle,
                match mode {
                    TunerGainMode::Manual => 1,
                    TunerGainMode::Auto => 0,
                },
            )
        };
        tracing::debug!(ret, ?mode, "rtlsdr_set_tuner_gain_mode");
        if ret == 0 {
            *current = Some(mode);
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_set_tuner_gain_mode", ret))
        }
    }

    fn get_tuner_gain(&self) -> Result<i32, Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_get_tuner_gain(self.handle) };
        tracing::debug!(ret, "rtlsdr_get_tuner_gain");
        // 0 is what librtlsdr reports after a failed set_tuner_gain, so the caller
        // can't tell it apart from a real 0 dB anyway.
        Ok(ret)
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<(), Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_set_tuner_gain(self.handle, gain) };
        tracing::debug!(ret, gain, "rtlsdr_set_tuner_gain");
        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_set_tuner_gain", ret))
        }
    }

    fn set_agc_mode(&self, enable: bool) -> Result<(), Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_set_agc_mode(self.handle, enable as i32) };
        tracing::debug!(ret, ?enable, "rtlsdr_set_agc_mode");
        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_set_agc_mode", ret))
        }
    }

    fn reset_buffer(&self) -> Result<(), Error> {
        let _guard = self.tuner_gain_mode.lock();
        let ret = unsafe { rtlsdr_sys::rtlsdr_reset_buffer(self.handle) };
        tracing::debug!(ret, "rtlsdr_reset_buffer");
        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_reset_buffer", ret))
        }
    }

    fn read_async(
        &self,
        block_size: usize,
        callback: &mut dyn FnMut(&[u8]),
    ) -> Result<(), Error> {
        let block_size = u32::try_from(block_size)
            .map_err(|_| Error::InvalidArgument("block size too large"))?;

        let mut context = ReadContext {
            handle: self.handle,
            callback,
            panicked: false,
        };

        // doesn't return until rtlsdr_cancel_async is called or the device fails.
        let ret = unsafe {
            rtlsdr_sys::rtlsdr_read_async(
                self.handle,
                Some(read_async_callback),
                &mut context as *mut ReadContext as *mut c_void,
                0,
                block_size,
            )
        };
        tracing::debug!(ret, block_size, "rtlsdr_read_async");

        if context.panicked {
            tracing::error!("sample callback panicked");
        }

        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_read_async", ret))
        }
    }

    fn cancel_async(&self) -> Result<(), Error> {
        let ret = unsafe { rtlsdr_sys::rtlsdr_cancel_async(self.handle) };
        tracing::debug!(ret, "rtlsdr_cancel_async");
        if ret == 0 {
            Ok(())
        }
        else {
            Err(Error::from_lib("rtlsdr_cancel_async", ret))
        }
    }
}

struct ReadContext<'a> {
    handle: rtlsdr_sys::rtlsdr_dev_t,
    callback: &'a mut dyn FnMut(&[u8]),
    panicked: bool,
}

/// Called by librtlsdr on the thread inside `rtlsdr_read_async`.
unsafe extern "C" fn read_async_callback(buffer: *mut c_uchar, length: u32, context: *mut c_void) {
    if context.is_null() {
        return;
    }
    // SAFETY: context is the ReadContext passed to rtlsdr_read_async, which outlives
    // the read.
    let context = unsafe { &mut *(context as *mut ReadContext) };
    if context.panicked || buffer.is_null() {
        return;
    }

    // SAFETY: librtlsdr hands us a transfer buffer of `length` bytes.
    let bytes = unsafe { slice::from_raw_parts(buffer as *const u8, length as usize) };

    // unwinding into C is undefined behaviour.
    let result = catch_unwind(AssertUnwindSafe(|| (context.callback)(bytes)));
    if result.is_err() {
        context.panicked = true;
        let ret = unsafe { rtlsdr_sys::rtlsdr_cancel_async(context.handle) };
        tracing::debug!(ret, "rtlsdr_cancel_async");
    }
}
