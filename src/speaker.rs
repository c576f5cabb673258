//! Speaker downlink pipeline.
//!
//! Two halves share the session's bounded message queue:
//!
//! ```text
//!  /speaker frames ──▶ ingress ──▶ resequencer ──▶ queue ──▶ playback task
//!   (decrypted)         (receiver task)                      (OPUS decode,
//!                                                             volume, PCM ring)
//! ```
//!
//! Ingress enforces strict sequence order: messages up to R ahead are
//! parked, anything further is a protocol violation that tears the
//! session down, and a full queue triggers the overrun protocol (the
//! service retransmits from the sequence we report). The playback task
//! owns the decoder and the offset bookkeeping that drives the deferred
//! open/close handshake.

use crate::buffers::ByteLen;
use crate::events::{BufferState, Event};
use crate::protocol::{Chunk, ChunkReader};
use crate::resequencer::Resequencer;
use crate::session::{Session, ShutdownReason};
use crate::state::ClientState;
use audiopus::coder::Decoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long a queue push may wait before it counts as an overrun.
const PUSH_DEADLINE: Duration = Duration::from_millis(100);

/// Playback receive deadline; on expiry pending closes are honored.
const RECV_DEADLINE: Duration = Duration::from_secs(2);

/// Retry tick while the PCM ring drains.
const PCM_WRITE_RETRY: Duration = Duration::from_millis(40);

/// Largest frame duration the decoder may produce, in milliseconds.
const MAX_FRAME_MS: u32 = 120;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("opus decoder error: {0}")]
    Opus(#[from] audiopus::Error),
    #[error("decoded {got} samples, expected {expected}")]
    SampleCount { got: usize, expected: usize },
}

/// One decrypted message from the speaker topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerMessage {
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl ByteLen for SpeakerMessage {
    fn byte_len(&self) -> usize {
        self.payload.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Ingress
// ═══════════════════════════════════════════════════════════════════════

/// Sequencing state for the speaker topic. Lives on the receiver task.
pub struct SpeakerIngress {
    session: Arc<Session>,
    next_expected: u32,
    resequencer: Resequencer<SpeakerMessage>,
}

impl SpeakerIngress {
    pub fn new(session: Arc<Session>) -> Self {
        let depth = session.config.speaker_resequencing;
        SpeakerIngress {
            session,
            next_expected: 0,
            resequencer: Resequencer::new(depth),
        }
    }

    #[cfg(test)]
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Feed one decrypted speaker message through the sequencing rules.
    pub async fn handle(&mut self, msg: SpeakerMessage) {
        let session = self.session.clone();
        let sequence = msg.sequence;

        if sequence < self.next_expected {
            // Stale sequence: either a replay the crypto layer let through
            // or in-flight traffic from before an overrun retransmit.
            debug!(sequence, expected = self.next_expected, "dropping stale speaker sequence");
            return;
        }

        if sequence > self.next_expected {
            let ahead = (sequence - self.next_expected) as usize;
            if ahead > self.resequencer.depth() {
                if !session.overrun.load(Ordering::SeqCst) {
                    error!(
                        sequence,
                        expected = self.next_expected,
                        "speaker sequence out of resequencing range"
                    );
                    session.signal_shutdown(ShutdownReason::SpeakerSequenceOutOfRange {
                        sequence,
                        expected: self.next_expected,
                    });
                }
            } else {
                self.resequencer.park(ahead, msg);
            }
            return;
        }

        // The expected sequence arrived. If the service was retransmitting
        // after an overrun this ends the window; parked lookahead from a
        // mid-utterance barge-in is stale content and must go.
        if session.overrun.swap(false, Ordering::SeqCst)
            && session.mic_opened_during_overrun.swap(false, Ordering::SeqCst)
        {
            self.resequencer.clear();
        }

        let mut current = msg;
        loop {
            let before = session.speaker.queue.bytes();
            match session.speaker.queue.send(current, PUSH_DEADLINE).await {
                Err(rejected) => {
                    session.overrun.store(true, Ordering::SeqCst);
                    if session.state.contains(ClientState::MICROPHONE_OPEN) {
                        session.mic_opened_during_overrun.store(true, Ordering::SeqCst);
                    }
                    // Everything parked will be retransmitted anyway.
                    self.resequencer.clear();

                    if session.state.contains(ClientState::SPEAKER_OPEN) {
                        warn!(sequence = self.next_expected, "speaker queue overrun");
                        let event = Event::BufferStateChanged {
                            topic: "speaker",
                            sequence: self.next_expected,
                            state: BufferState::Overrun,
                        };
                        if let Err(e) = session.send_event(event).await {
                            warn!(error = %e, "failed to report overrun");
                        }
                        // Stop pushing until the retransmit arrives at
                        // next_expected.
                    } else {
                        // Closed speaker: quietly age out the oldest data.
                        let dropped = session.speaker.queue.force_send(rejected);
                        debug!(dropped, "aged out speaker messages while closed");
                        self.next_expected = self.next_expected.wrapping_add(1);
                    }
                    return;
                }
                Ok(()) => {
                    let after = session.speaker.queue.bytes();
                    let warn_at = session.config.speaker_overrun_warning;
                    if session.state.contains(ClientState::SPEAKER_OPEN)
                        && before < warn_at
                        && after >= warn_at
                    {
                        let event = Event::BufferStateChanged {
                            topic: "speaker",
                            sequence: self.next_expected,
                            state: BufferState::OverrunWarning,
                        };
                        if let Err(e) = session.send_event(event).await {
                            warn!(error = %e, "failed to report overrun warning");
                        }
                    }

                    self.next_expected = self.next_expected.wrapping_add(1);
                    match self.resequencer.rotate() {
                        Some(parked) => current = parked,
                        None => return,
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Playback
// ═══════════════════════════════════════════════════════════════════════

fn sample_rate(hz: u32) -> Option<SampleRate> {
    match hz {
        8_000 => Some(SampleRate::Hz8000),
        12_000 => Some(SampleRate::Hz12000),
        16_000 => Some(SampleRate::Hz16000),
        24_000 => Some(SampleRate::Hz24000),
        48_000 => Some(SampleRate::Hz48000),
        _ => None,
    }
}

fn channels(n: u32) -> Option<Channels> {
    match n {
        1 => Some(Channels::Mono),
        2 => Some(Channels::Stereo),
        _ => None,
    }
}

/// Scale PCM in place: `sample * volume / 128`, volume 0..=100.
fn scale_volume(samples: &mut [i16], volume: u32) {
    for sample in samples.iter_mut() {
        *sample = ((*sample as i32 * volume as i32) >> 7) as i16;
    }
}

/// Decode one compressed frame into `scratch`, expecting exactly
/// `expected_samples` samples.
fn decode_frame(
    decoder: &mut Decoder,
    frame: &[u8],
    scratch: &mut [i16],
    expected_samples: usize,
) -> Result<usize, DecodeError> {
    let packet: Packet<'_> = frame.try_into()?;
    let signals: MutSignals<'_, i16> = (&mut scratch[..]).try_into()?;
    let got = decoder.decode(Some(packet), signals, false)?;
    if got != expected_samples {
        return Err(DecodeError::SampleCount {
            got,
            expected: expected_samples,
        });
    }
    Ok(got)
}

/// The speaker playback task: drains the queue, decodes, writes PCM, and
/// runs the offset-driven open/close handshake.
pub async fn playback_task(session: Arc<Session>) {
    let config = &session.config;
    let (Some(rate), Some(chans)) = (
        sample_rate(config.speaker_sample_rate),
        channels(config.speaker_channels),
    ) else {
        error!(
            rate = config.speaker_sample_rate,
            channels = config.speaker_channels,
            "unsupported speaker decoder configuration"
        );
        session.signal_shutdown(ShutdownReason::StreamingFailure);
        return;
    };
    let mut decoder = match Decoder::new(rate, chans) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to create speaker decoder");
            session.signal_shutdown(ShutdownReason::StreamingFailure);
            return;
        }
    };

    let frame_size = config.decoder_frame_size();
    let expected_samples = config.raw_frame_samples();
    let max_samples =
        (config.speaker_sample_rate * MAX_FRAME_MS / 1000) as usize * config.speaker_channels as usize;
    let mut scratch = vec![0i16; max_samples];
    let mut pcm_bytes = vec![0u8; expected_samples * 2];
    let mut last_sequence: u32 = 0;

    info!("speaker task up");
    loop {
        if !session.state.contains(ClientState::SPEAKER_OPEN) {
            session
                .state
                .wait_any(ClientState::OPEN_SPEAKER_RECEIVED | ClientState::SPEAKER_OPEN)
                .await;
        }

        let before = session.speaker.queue.bytes();
        if before == 0 && !session.state.contains(ClientState::OPEN_SPEAKER_RECEIVED) {
            let event = Event::BufferStateChanged {
                topic: "speaker",
                sequence: last_sequence.wrapping_add(1),
                state: BufferState::Underrun,
            };
            if let Err(e) = session.send_event(event).await {
                error!(error = %e, "failed to report underrun");
                session.signal_shutdown(ShutdownReason::StreamingFailure);
                return;
            }
        }

        let Some(msg) = session.speaker.queue.recv(RECV_DEADLINE).await else {
            debug!("no data in the speaker queue");
            if close_pending(&session) && close_now(&session).await.is_err() {
                return;
            }
            continue;
        };

        last_sequence = msg.sequence;
        let after = session.speaker.queue.bytes();
        let mut reader = ChunkReader::new(&msg.payload);
        for chunk in &mut reader {
            match chunk {
                Chunk::Audio { offset, frames, data } => {
                    let frame_count = frames as usize + 1;
                    if data.len() != frame_count * frame_size {
                        warn!(
                            sequence = msg.sequence,
                            len = data.len(),
                            frame_count,
                            "audio chunk does not divide into decoder frames, skipping"
                        );
                        continue;
                    }
                    if offset < session.speaker.open_offset.load(Ordering::SeqCst) {
                        // Pre-roll from before the requested start point.
                        continue;
                    }

                    if session.state.contains(ClientState::OPEN_SPEAKER_RECEIVED) {
                        session.state.clear(ClientState::OPEN_SPEAKER_RECEIVED);
                        session.speaker.open_offset.store(offset, Ordering::SeqCst);
                        if let Err(e) = session.open_speaker(offset).await {
                            error!(error = %e, "failed to open speaker");
                            session.signal_shutdown(ShutdownReason::StreamingFailure);
                            return;
                        }
                    }

                    debug!(sequence = msg.sequence, offset, "playing");
                    let volume = session.volume();
                    for frame in data.chunks_exact(frame_size) {
                        match decode_frame(&mut decoder, frame, &mut scratch, expected_samples) {
                            Ok(samples) => {
                                scale_volume(&mut scratch[..samples], volume);
                                for (bytes, sample) in
                                    pcm_bytes.chunks_exact_mut(2).zip(&scratch[..samples])
                                {
                                    bytes.copy_from_slice(&sample.to_le_bytes());
                                }
                                session
                                    .speaker
                                    .output
                                    .write_all(&pcm_bytes[..samples * 2], PCM_WRITE_RETRY)
                                    .await;
                            }
                            Err(e) => warn!(sequence = msg.sequence, error = %e, "opus decode failed"),
                        }
                    }
                    session
                        .speaker
                        .output_offset
                        .store(offset + data.len() as u64, Ordering::SeqCst);
                }
                Chunk::Marker(marker) => {
                    debug!(marker, "speaker marker");
                    if let Err(e) = session
                        .send_event(Event::SpeakerMarkerEncountered { marker })
                        .await
                    {
                        error!(error = %e, "failed to report marker");
                        session.signal_shutdown(ShutdownReason::StreamingFailure);
                        return;
                    }
                }
            }
        }
        if !reader.finished() {
            warn!(sequence = msg.sequence, "trailing bytes in speaker message");
        }

        if session.state.contains(ClientState::SPEAKER_OPEN) {
            let warn_at = session.config.speaker_underrun_warning;
            let open = session.speaker.open_offset.load(Ordering::SeqCst);
            let close = session.speaker.close_offset.load(Ordering::SeqCst);
            let output = session.speaker.output_offset.load(Ordering::SeqCst);

            if underrun_warning_due(before, after, warn_at, open, close, output) {
                let event = Event::BufferStateChanged {
                    topic: "speaker",
                    sequence: last_sequence,
                    state: BufferState::UnderrunWarning,
                };
                if let Err(e) = session.send_event(event).await {
                    error!(error = %e, "failed to report underrun warning");
                    session.signal_shutdown(ShutdownReason::StreamingFailure);
                    return;
                }
            }

            if close_pending(&session) && close_now(&session).await.is_err() {
                return;
            }
        }
    }
}

/// The underrun warning fires on a downward crossing of the threshold,
/// unless the stream is already within the threshold of its announced
/// close offset (the drain is expected then).
fn underrun_warning_due(
    before: usize,
    after: usize,
    warn_at: usize,
    open: u64,
    close: u64,
    output: u64,
) -> bool {
    let near_close = close > open && close.saturating_sub(output) < warn_at as u64;
    before > warn_at && after <= warn_at && !near_close
}

/// A close is due when the announced close offset has been reached, or a
/// CloseSpeaker with no offset is outstanding.
fn close_pending(session: &Session) -> bool {
    let open = session.speaker.open_offset.load(Ordering::SeqCst);
    let close = session.speaker.close_offset.load(Ordering::SeqCst);
    let output = session.speaker.output_offset.load(Ordering::SeqCst);
    (close > open && close == output)
        || session.state.contains(ClientState::CLOSE_SPEAKER_NO_OFFSET)
}

/// Close at the current output offset. Errors are fatal to the task.
async fn close_now(session: &Arc<Session>) -> Result<(), ()> {
    session.state.clear(ClientState::CLOSE_SPEAKER_NO_OFFSET);
    let output = session.speaker.output_offset.load(Ordering::SeqCst);
    session.speaker.close_offset.store(output, Ordering::SeqCst);
    if let Err(e) = session.close_speaker(output).await {
        error!(error = %e, "failed to close speaker");
        session.signal_shutdown(ShutdownReason::StreamingFailure);
        return Err(());
    }
    Ok(())
}
