//! Decoded audio playback and animation handoff.
//!
//! Synthesized audio arrives as encoded bytes (MP3 or WAV depending on the
//! provider). It is decoded to PCM once, then handed to both the playback
//! sink and the animation sink so lip-sync sees exactly what the speakers
//! play. At most one reply plays at a time; starting a new one interrupts
//! the old.

use crate::error::{KaiwaError, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Interleaved PCM ready for playback and lip-sync analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.sample_rate as f32 * self.channels as f32)
    }
}

/// Decode encoded audio bytes into interleaved PCM.
pub fn decode_audio(bytes: &[u8]) -> Result<DecodedAudio> {
    let mss = MediaSourceStream::new(
        Box::new(Cursor::new(bytes.to_vec())),
        Default::default(),
    );

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| KaiwaError::Playback {
            message: format!("unrecognized audio format: {e}"),
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| KaiwaError::Playback {
            message: "no decodable audio track".to_string(),
        })?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| KaiwaError::Playback {
            message: format!("unsupported codec: {e}"),
        })?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                return Err(KaiwaError::Playback {
                    message: format!("failed to read audio packet: {e}"),
                });
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let buf = sample_buf.get_or_insert_with(|| {
                    SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())
                });
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // Corrupt frames are skipped, decoding continues
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("skipping undecodable audio frame: {e}");
            }
            Err(e) => {
                return Err(KaiwaError::Playback {
                    message: format!("audio decode failed: {e}"),
                });
            }
        }
    }

    if samples.is_empty() {
        return Err(KaiwaError::Playback {
            message: "audio stream contained no samples".to_string(),
        });
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Receives play/stop notifications for lip-sync and avatar animation.
pub trait AnimationSink: Send {
    fn on_play(&mut self, audio: &DecodedAudio);
    fn on_stop(&mut self);
}

/// Plays decoded PCM on some output.
pub trait PlaybackSink: Send {
    fn play(&mut self, audio: DecodedAudio) -> Result<()>;
    fn stop(&mut self);
}

/// Owns the single playback slot.
///
/// `play` interrupts whatever is active before starting the new clip, and
/// mirrors every transition to the animation sink. `stop` is idempotent.
pub struct AudioPlayer {
    sink: Box<dyn PlaybackSink>,
    animation: Option<Box<dyn AnimationSink>>,
    playing: bool,
}

impl AudioPlayer {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            animation: None,
            playing: false,
        }
    }

    pub fn with_animation_sink(mut self, animation: Box<dyn AnimationSink>) -> Self {
        self.animation = Some(animation);
        self
    }

    /// Play a clip, interrupting any active one first.
    pub fn play(&mut self, audio: DecodedAudio) -> Result<()> {
        self.stop();
        if let Some(animation) = &mut self.animation {
            animation.on_play(&audio);
        }
        if let Err(e) = self.sink.play(audio) {
            // The sink never started, so the animation must not keep running.
            if let Some(animation) = &mut self.animation {
                animation.on_stop();
            }
            return Err(e);
        }
        self.playing = true;
        Ok(())
    }

    /// Stop playback if active. Safe to call at any time.
    pub fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.sink.stop();
        if let Some(animation) = &mut self.animation {
            animation.on_stop();
        }
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

/// Playback sink that discards audio. Useful for headless runs.
pub struct NullPlaybackSink;

impl PlaybackSink for NullPlaybackSink {
    fn play(&mut self, _audio: DecodedAudio) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Recording playback sink for tests.
pub struct MockPlaybackSink {
    plays: std::sync::Arc<std::sync::Mutex<Vec<DecodedAudio>>>,
    stops: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    fail_play: bool,
}

impl MockPlaybackSink {
    pub fn new() -> Self {
        Self {
            plays: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            stops: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            fail_play: false,
        }
    }

    pub fn with_play_failure(mut self) -> Self {
        self.fail_play = true;
        self
    }

    /// Handle to the clips handed to `play`, usable after the sink moves
    /// into a player.
    pub fn plays_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<DecodedAudio>>> {
        self.plays.clone()
    }

    /// Handle to the stop call count.
    pub fn stops_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.stops.clone()
    }
}

impl Default for MockPlaybackSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for MockPlaybackSink {
    fn play(&mut self, audio: DecodedAudio) -> Result<()> {
        if self.fail_play {
            return Err(KaiwaError::Playback {
                message: "mock sink refused to play".to_string(),
            });
        }
        let mut guard = match self.plays.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(audio);
        Ok(())
    }

    fn stop(&mut self) {
        self.stops
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Recording animation sink for tests.
pub struct MockAnimationSink {
    play_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    stop_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl MockAnimationSink {
    pub fn new() -> Self {
        Self {
            play_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            stop_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub fn play_count_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.play_count.clone()
    }

    pub fn stop_count_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.stop_count.clone()
    }
}

impl Default for MockAnimationSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimationSink for MockAnimationSink {
    fn on_play(&mut self, _audio: &DecodedAudio) {
        self.play_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_stop(&mut self) {
        self.stop_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Playback through the default output device via rodio.
#[cfg(feature = "playback-device")]
pub struct RodioPlaybackSink {
    output: SendOutput,
    sink: Option<rodio::Sink>,
}

/// Wrapper to make the rodio output stream Send.
///
/// SAFETY: the stream is owned by this sink and only touched through
/// `&mut self`, never concurrently.
#[cfg(feature = "playback-device")]
struct SendOutput {
    _stream: rodio::OutputStream,
    handle: rodio::OutputStreamHandle,
}

#[cfg(feature = "playback-device")]
unsafe impl Send for SendOutput {}

#[cfg(feature = "playback-device")]
impl RodioPlaybackSink {
    pub fn new() -> Result<Self> {
        let (stream, handle) =
            rodio::OutputStream::try_default().map_err(|e| KaiwaError::Playback {
                message: format!("no audio output device: {e}"),
            })?;
        Ok(Self {
            output: SendOutput {
                _stream: stream,
                handle,
            },
            sink: None,
        })
    }
}

#[cfg(feature = "playback-device")]
impl PlaybackSink for RodioPlaybackSink {
    fn play(&mut self, audio: DecodedAudio) -> Result<()> {
        self.stop();
        let sink =
            rodio::Sink::try_new(&self.output.handle).map_err(|e| KaiwaError::Playback {
                message: format!("failed to open playback sink: {e}"),
            })?;
        sink.append(rodio::buffer::SamplesBuffer::new(
            audio.channels,
            audio.sample_rate,
            audio.samples,
        ));
        self.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }
}
