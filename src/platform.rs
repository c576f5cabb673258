//! Seam to the device hardware.
//!
//! The session drives capture, playback, the indicator LED and the touch
//! button through this trait; audio bytes themselves move through the
//! session's buffer entry points, not through here. All methods are
//! non-blocking notifications.

pub trait Platform: Send + Sync {
    /// Start feeding capture data into the microphone ring.
    fn microphone_open(&self);
    /// Stop capture.
    fn microphone_close(&self);
    /// Start draining the decoded PCM ring to the output device.
    fn speaker_open(&self);
    /// Stop output.
    fn speaker_close(&self);
    fn indicator_on(&self);
    fn indicator_off(&self);
    fn indicator_blink(&self, interval_ms: u32);
    fn touch_button_enable(&self);
    fn touch_button_disable(&self);
}

/// Default platform: logs every transition. Stands in on hosts without
/// device hardware and in tests.
pub struct LogPlatform;

impl Platform for LogPlatform {
    fn microphone_open(&self) {
        tracing::info!("platform: microphone capture on");
    }

    fn microphone_close(&self) {
        tracing::info!("platform: microphone capture off");
    }

    fn speaker_open(&self) {
        tracing::info!("platform: speaker output on");
    }

    fn speaker_close(&self) {
        tracing::info!("platform: speaker output off");
    }

    fn indicator_on(&self) {
        tracing::debug!("platform: indicator on");
    }

    fn indicator_off(&self) {
        tracing::debug!("platform: indicator off");
    }

    fn indicator_blink(&self, interval_ms: u32) {
        tracing::debug!(interval_ms, "platform: indicator blink");
    }

    fn touch_button_enable(&self) {
        tracing::debug!("platform: touch button enabled");
    }

    fn touch_button_disable(&self) {
        tracing::debug!("platform: touch button disabled");
    }
}
