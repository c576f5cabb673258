use clap::Parser;

/// Encrypted MQTT voice-assistant client: streams microphone audio to the
/// service, plays back OPUS speaker audio, and follows service directives.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// MQTT broker host (AWS IoT endpoint)
    #[arg(long, default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 8883)]
    pub mqtt_port: u16,

    /// AWS account id placed in the Connect payload
    #[arg(long, env = "AIS_AWS_ACCOUNT_ID", default_value = "")]
    pub aws_account_id: String,

    /// Root segment of every topic
    #[arg(long, env = "AIS_TOPIC_ROOT", default_value = "")]
    pub topic_root: String,

    /// Protocol API version segment
    #[arg(long, default_value = "v1")]
    pub api_version: String,

    /// Thing name: MQTT client id and topic segment
    #[arg(long, env = "AIS_THING_NAME", default_value = "ais-client")]
    pub thing_name: String,

    /// Client public key (base64 curve25519)
    #[arg(long, env = "AIS_CLIENT_PUBLIC_KEY", default_value = "")]
    pub client_public_key: String,

    /// Client private key (base64 curve25519)
    #[arg(long, env = "AIS_CLIENT_PRIVATE_KEY", default_value = "")]
    pub client_private_key: String,

    /// Service public key (base64 curve25519)
    #[arg(long, env = "AIS_PEER_PUBLIC_KEY", default_value = "")]
    pub peer_public_key: String,

    // ── Microphone pipeline ────────────────────────────────────────────

    /// Microphone sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    pub mic_sample_rate: u32,

    /// Microphone channel count
    #[arg(long, default_value_t = 1)]
    pub mic_channels: u32,

    /// Microphone frame duration in milliseconds
    #[arg(long, default_value_t = 20)]
    pub mic_frame_ms: u32,

    /// Microphone sample resolution in bits (16 or 32)
    #[arg(long, default_value_t = 16)]
    pub mic_sample_bits: u32,

    /// Capture ring capacity in frames
    #[arg(long, default_value_t = 10)]
    pub mic_buffer_frames: u32,

    // ── Speaker pipeline ───────────────────────────────────────────────

    /// Speaker message queue capacity in bytes
    #[arg(long, default_value_t = 32_000)]
    pub speaker_buffer_size: usize,

    /// Queue fill level (bytes) above which OVERRUN_WARNING is reported
    #[arg(long, default_value_t = 22_000)]
    pub speaker_overrun_warning: usize,

    /// Queue fill level (bytes) below which UNDERRUN_WARNING is reported
    #[arg(long, default_value_t = 10_000)]
    pub speaker_underrun_warning: usize,

    /// Speaker sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    pub speaker_sample_rate: u32,

    /// Speaker channel count
    #[arg(long, default_value_t = 1)]
    pub speaker_channels: u32,

    /// Speaker sample resolution in bits
    #[arg(long, default_value_t = 16)]
    pub speaker_sample_bits: u32,

    /// Speaker frame duration in milliseconds
    #[arg(long, default_value_t = 20)]
    pub speaker_frame_ms: u32,

    /// Constant OPUS decoder bitrate in bits per second
    #[arg(long, default_value_t = 64_000)]
    pub speaker_bitrate: u32,

    /// Decoded PCM ring capacity in frames
    #[arg(long, default_value_t = 1)]
    pub decoder_buffer_frames: u32,

    /// Out-of-order speaker messages tolerated before the stream is torn down
    #[arg(long, default_value_t = 4)]
    pub speaker_resequencing: usize,

    // ── Transport sizing ───────────────────────────────────────────────

    /// Maximum size of one transport message in bytes
    #[arg(long, default_value_t = 5_400)]
    pub message_max_size: usize,

    /// Raw audio bytes carried per microphone message
    #[arg(long, default_value_t = 4_800)]
    pub audio_data_size: usize,

    // ── Session orchestration ──────────────────────────────────────────

    /// Attempts to reconnect before giving up
    #[arg(long, default_value_t = 5)]
    pub reconnect_retry: u32,

    /// Initial reconnect interval in milliseconds (doubles per attempt)
    #[arg(long, default_value_t = 200)]
    pub reconnect_interval_ms: u64,

    /// Timeout for connection and capability acknowledgements, milliseconds
    #[arg(long, default_value_t = 5_000)]
    pub default_timeout_ms: u64,

    /// Initial speaker volume (0-100)
    #[arg(long, default_value_t = 100)]
    pub default_volume: u32,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 0)]
    pub stats_interval_secs: u64,
}

impl Config {
    /// `{root}/ais/{version}/{thing}` — the prefix shared by all topics.
    pub fn topic_head(&self) -> String {
        format!(
            "{}/ais/{}/{}",
            self.topic_root, self.api_version, self.thing_name
        )
    }

    /// Compressed bytes per OPUS frame at the constant bitrate.
    pub fn decoder_frame_size(&self) -> usize {
        (self.speaker_bitrate * self.speaker_frame_ms / 1000 / 8) as usize
    }

    /// PCM samples produced by decoding one frame.
    pub fn raw_frame_samples(&self) -> usize {
        (self.speaker_sample_rate * self.speaker_frame_ms / 1000) as usize
    }

    /// PCM bytes produced by decoding one frame.
    pub fn raw_frame_size(&self) -> usize {
        self.raw_frame_samples() * (self.speaker_channels * self.speaker_sample_bits / 8) as usize
    }

    /// Capacity of the decoded PCM ring the platform speaker drains.
    pub fn decode_buffer_size(&self) -> usize {
        self.raw_frame_size() * self.decoder_buffer_frames as usize
    }

    /// Bytes captured per microphone frame.
    pub fn mic_frame_size(&self) -> usize {
        (self.mic_channels * self.mic_sample_rate * self.mic_frame_ms / 1000) as usize
            * (self.mic_sample_bits / 8) as usize
    }

    /// Capacity of the microphone capture ring.
    pub fn mic_buffer_size(&self) -> usize {
        self.mic_frame_size() * self.mic_buffer_frames as usize
    }

    /// Time to fill one full microphone message, plus 50 ms of slack.
    pub fn mic_chunk_timeout_ms(&self) -> u64 {
        let bytes_per_ms = (self.mic_sample_rate * self.mic_sample_bits / 8 / 1000) as usize;
        (self.audio_data_size / bytes_per_ms) as u64 + 50
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::parse_from(["ais-voice-client"])
    }

    #[test]
    fn derived_audio_constants() {
        let cfg = defaults();
        // 64 kbit/s at 20 ms frames -> 160 compressed bytes per frame
        assert_eq!(cfg.decoder_frame_size(), 160);
        // 16 kHz at 20 ms -> 320 samples -> 640 PCM bytes
        assert_eq!(cfg.raw_frame_samples(), 320);
        assert_eq!(cfg.raw_frame_size(), 640);
        assert_eq!(cfg.decode_buffer_size(), 640);
        // 20 ms of 16 kHz/16-bit mono capture -> 640 bytes, ring holds 10
        assert_eq!(cfg.mic_frame_size(), 640);
        assert_eq!(cfg.mic_buffer_size(), 6_400);
    }

    #[test]
    fn mic_chunk_timeout_covers_message_duration() {
        let cfg = defaults();
        // 4800 bytes at 32 bytes/ms = 150 ms, plus 50 ms slack
        assert_eq!(cfg.mic_chunk_timeout_ms(), 200);
    }

    #[test]
    fn topic_head_composition() {
        let cfg = Config::parse_from([
            "ais-voice-client",
            "--topic-root",
            "things",
            "--thing-name",
            "kitchen",
        ]);
        assert_eq!(cfg.topic_head(), "things/ais/v1/kitchen");
    }
}
