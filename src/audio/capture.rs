//! Microphone capture behind a swappable trait.

use crate::error::Result;

#[cfg(feature = "cpal-audio")]
use crate::error::KaiwaError;

/// Trait for microphone capture devices.
///
/// This trait allows swapping implementations (real device vs mock vs WAV
/// file). Frames are 16-bit PCM mono at the configured sample rate, sized by
/// whatever the device delivered since the last read.
pub trait MicrophoneSource: Send {
    /// Start capturing audio.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Read the samples captured since the last call.
    ///
    /// An empty frame is normal while the device warms up. A finite source
    /// (file, scripted mock) returns empty frames forever once exhausted.
    fn read_frame(&mut self) -> Result<Vec<i16>>;

    /// True when this source ends on its own (file or scripted input).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Mock microphone source for testing.
#[derive(Debug, Clone)]
pub struct MockMicrophoneSource {
    frames: Vec<Vec<i16>>,
    cursor: usize,
    started: bool,
    should_fail_start: bool,
}

impl MockMicrophoneSource {
    pub fn new() -> Self {
        Self {
            frames: vec![vec![0i16; 240]],
            cursor: 0,
            started: false,
            should_fail_start: false,
        }
    }

    /// Frames returned by successive `read_frame` calls.
    pub fn with_frames(mut self, frames: Vec<Vec<i16>>) -> Self {
        self.frames = frames;
        self
    }

    /// Make `start` fail.
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }
}

impl Default for MockMicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrophoneSource for MockMicrophoneSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(crate::error::KaiwaError::AudioCapture {
                message: "mock microphone failed to start".to_string(),
            });
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<i16>> {
        if !self.started || self.cursor >= self.frames.len() {
            return Ok(Vec::new());
        }
        let frame = self.frames[self.cursor].clone();
        self.cursor += 1;
        Ok(frame)
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// Real microphone capture using CPAL.
///
/// Captures mono 16-bit PCM at the requested sample rate, converting from the
/// device's native f32 stream when needed. Samples accumulate in a shared
/// buffer that `read_frame` drains.
#[cfg(feature = "cpal-audio")]
pub struct CpalMicrophoneSource {
    device: cpal::Device,
    stream: Option<SendStream>,
    buffer: std::sync::Arc<std::sync::Mutex<Vec<i16>>>,
    sample_rate: u32,
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is owned by this source and only touched from the
/// thread driving it; exclusive access is guaranteed by `&mut self`.
#[cfg(feature = "cpal-audio")]
struct SendStream(cpal::Stream);

#[cfg(feature = "cpal-audio")]
unsafe impl Send for SendStream {}

#[cfg(feature = "cpal-audio")]
impl CpalMicrophoneSource {
    /// Create a capture source on the default input device.
    pub fn new(sample_rate: u32) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| KaiwaError::AudioCapture {
                message: "no default input device".to_string(),
            })?;

        Ok(Self {
            device,
            stream: None,
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            sample_rate,
        })
    }
}

#[cfg(feature = "cpal-audio")]
impl MicrophoneSource for CpalMicrophoneSource {
    fn start(&mut self) -> Result<()> {
        use cpal::traits::{DeviceTrait, StreamTrait};

        if self.stream.is_some() {
            return Ok(());
        }

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = self.buffer.clone();
        let stream = self
            .device
            .build_input_stream(
                &config,
                move |data: &[f32], _| {
                    let mut guard = match buffer.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.extend(
                        data.iter()
                            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                    );
                },
                move |e| log::warn!("microphone stream error: {e}"),
                None,
            )
            .map_err(|e| KaiwaError::AudioCapture {
                message: format!("failed to build input stream: {e}"),
            })?;

        stream.play().map_err(|e| KaiwaError::AudioCapture {
            message: format!("failed to start input stream: {e}"),
        })?;

        self.stream = Some(SendStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Dropping the stream releases the device
        self.stream = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<i16>> {
        let mut guard = match self.buffer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(std::mem::take(&mut *guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_returns_scripted_frames_in_order() {
        let mut mic = MockMicrophoneSource::new()
            .with_frames(vec![vec![1i16; 10], vec![2i16; 10]]);
        mic.start().expect("start");

        assert_eq!(mic.read_frame().expect("read"), vec![1i16; 10]);
        assert_eq!(mic.read_frame().expect("read"), vec![2i16; 10]);
        // Exhausted: empty frames from here on
        assert!(mic.read_frame().expect("read").is_empty());
    }

    #[test]
    fn test_mock_before_start_is_empty() {
        let mut mic = MockMicrophoneSource::new();
        assert!(mic.read_frame().expect("read").is_empty());
    }

    #[test]
    fn test_mock_start_failure() {
        let mut mic = MockMicrophoneSource::new().with_start_failure();
        assert!(mic.start().is_err());
    }

    #[test]
    fn test_mock_stop_is_idempotent() {
        let mut mic = MockMicrophoneSource::new();
        mic.stop().expect("stop without start");
        mic.start().expect("start");
        mic.stop().expect("stop");
        mic.stop().expect("second stop");
    }

    #[test]
    fn test_mock_is_finite() {
        let mic = MockMicrophoneSource::new();
        assert!(mic.is_finite());
    }
}
