//! Audible cues for alerts.
//!
//! Tones are synthesized once as sine bursts with an exponential gain decay
//! and handed to an [`AudioOutput`]. Sound is best-effort: an output that
//! cannot be constructed or fails to play is logged and ignored.

use std::f32::consts::TAU;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::alert::Severity;

/// Sample rate of synthesized tones.
pub const SAMPLE_RATE: u32 = 44_100;

/// Pitch used for info and warning alerts.
pub const NORMAL_PITCH_HZ: f32 = 880.0;

/// Pitch used for critical alerts.
pub const CRITICAL_PITCH_HZ: f32 = 1_140.0;

/// Length of one beep.
pub const TONE_DURATION: Duration = Duration::from_millis(180);

/// Time for the gain to fall from peak to the floor.
pub const DECAY_DURATION: Duration = Duration::from_millis(80);

const GAIN_PEAK: f32 = 0.25;
const GAIN_FLOOR: f32 = 0.001;

/// Beeps in one alarm sequence.
const ALARM_REPEATS: usize = 3;
const ALARM_GAP: Duration = Duration::from_millis(120);

/// Errors raised by audio outputs.
#[derive(Debug, Error)]
pub enum AudioError {
    /// No usable audio device.
    #[error("audio output unavailable: {0}")]
    Unavailable(String),

    /// The device rejected the samples.
    #[error("audio playback failed: {0}")]
    Playback(String),
}

/// A sink for mono `f32` samples.
pub trait AudioOutput: Send + Sync + std::fmt::Debug {
    /// Play the samples. May return before playback finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the samples could not be queued.
    fn play(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError>;
}

/// Rings the terminal bell; the waveform itself is not reproduced.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl AudioOutput for TerminalBell {
    fn play(&self, samples: &[f32], _sample_rate: u32) -> Result<(), AudioError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut err = std::io::stderr().lock();
        err.write_all(b"\x07")
            .and_then(|()| err.flush())
            .map_err(|e| AudioError::Playback(e.to_string()))
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl AudioOutput for Silent {
    fn play(&self, _samples: &[f32], _sample_rate: u32) -> Result<(), AudioError> {
        Ok(())
    }
}

type OutputFactory = Box<dyn Fn() -> Result<Box<dyn AudioOutput>, AudioError> + Send + Sync>;

/// Synthesize one beep at `frequency_hz`.
#[must_use]
pub fn synthesize(frequency_hz: f32, sample_rate: u32) -> Vec<f32> {
    #[allow(clippy::cast_precision_loss)]
    let rate = sample_rate as f32;
    let total = duration_samples(TONE_DURATION, sample_rate);
    let decay_secs = DECAY_DURATION.as_secs_f32();
    let ratio = GAIN_FLOOR / GAIN_PEAK;

    (0..total)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / rate;
            let gain = if t >= decay_secs {
                GAIN_FLOOR
            } else {
                GAIN_PEAK * ratio.powf(t / decay_secs)
            };
            gain * (TAU * frequency_hz * t).sin()
        })
        .collect()
}

fn duration_samples(duration: Duration, sample_rate: u32) -> usize {
    let samples = duration.as_secs_f64() * f64::from(sample_rate);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let samples = samples.round() as usize;
    samples
}

/// A reusable cue player.
///
/// The output is created on first use and kept; if creation fails the next
/// cue tries again.
pub struct ToneCue {
    factory: OutputFactory,
    output: Mutex<Option<Box<dyn AudioOutput>>>,
    normal: Vec<f32>,
    critical: Vec<f32>,
}

impl std::fmt::Debug for ToneCue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneCue")
            .field("normal_samples", &self.normal.len())
            .field("critical_samples", &self.critical.len())
            .finish_non_exhaustive()
    }
}

impl ToneCue {
    /// Create a cue player whose output is built lazily by `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn AudioOutput>, AudioError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            output: Mutex::new(None),
            normal: synthesize(NORMAL_PITCH_HZ, SAMPLE_RATE),
            critical: synthesize(CRITICAL_PITCH_HZ, SAMPLE_RATE),
        }
    }

    /// Cue player that rings the terminal bell.
    #[must_use]
    pub fn terminal() -> Self {
        Self::new(|| Ok(Box::new(TerminalBell)))
    }

    /// Cue player that never makes a sound.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(|| Ok(Box::new(Silent)))
    }

    /// Play the short beep for an alert of `severity`.
    pub fn beep(&self, severity: Severity) {
        let samples = if severity.is_critical() {
            &self.critical
        } else {
            &self.normal
        };
        self.play(samples);
    }

    /// Play the louder, repeated alarm used for throttled detections.
    pub fn alarm(&self) {
        let gap = vec![0.0; duration_samples(ALARM_GAP, SAMPLE_RATE)];
        let mut samples = Vec::with_capacity((self.critical.len() + gap.len()) * ALARM_REPEATS);
        for _ in 0..ALARM_REPEATS {
            samples.extend_from_slice(&self.critical);
            samples.extend_from_slice(&gap);
        }
        self.play(&samples);
    }

    fn play(&self, samples: &[f32]) {
        let Ok(mut guard) = self.output.lock() else {
            return;
        };
        if guard.is_none() {
            match (self.factory)() {
                Ok(output) => *guard = Some(output),
                Err(e) => {
                    debug!(error = %e, "Audio output unavailable, skipping cue");
                    return;
                }
            }
        }
        if let Some(output) = guard.as_ref() {
            if let Err(e) = output.play(samples, SAMPLE_RATE) {
                debug!(error = %e, "Audio cue failed");
            } else {
                trace!(samples = samples.len(), "Audio cue played");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        played: Mutex<Vec<usize>>,
    }

    #[derive(Debug)]
    struct SharedRecorder(Arc<Recorder>);

    impl AudioOutput for SharedRecorder {
        fn play(&self, samples: &[f32], _sample_rate: u32) -> Result<(), AudioError> {
            self.0.played.lock().unwrap().push(samples.len());
            Ok(())
        }
    }

    #[test]
    fn test_synthesize_length() {
        let samples = synthesize(NORMAL_PITCH_HZ, SAMPLE_RATE);
        // 180 ms at 44.1 kHz
        assert_eq!(samples.len(), 7_938);
    }

    #[test]
    fn test_synthesize_decays() {
        let samples = synthesize(NORMAL_PITCH_HZ, SAMPLE_RATE);
        let head = samples[..400].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let tail = samples[samples.len() - 400..]
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(head > 0.1);
        assert!(tail <= GAIN_FLOOR + f32::EPSILON);
    }

    #[test]
    fn test_synthesize_bounded() {
        let samples = synthesize(CRITICAL_PITCH_HZ, SAMPLE_RATE);
        assert!(samples.iter().all(|s| s.abs() <= GAIN_PEAK));
    }

    #[test]
    fn test_output_is_reused() {
        let recorder = Arc::new(Recorder::default());
        let built = Arc::new(AtomicUsize::new(0));
        let cue = {
            let recorder = Arc::clone(&recorder);
            let built = Arc::clone(&built);
            ToneCue::new(move || {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(SharedRecorder(Arc::clone(&recorder))))
            })
        };

        cue.beep(Severity::Info);
        cue.beep(Severity::Critical);
        cue.alarm();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.played.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_construction_is_swallowed_and_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let cue = {
            let attempts = Arc::clone(&attempts);
            ToneCue::new(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AudioError::Unavailable("no device".to_string()))
            })
        };

        cue.beep(Severity::Warning);
        cue.beep(Severity::Warning);

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_alarm_is_longer_than_beep() {
        let recorder = Arc::new(Recorder::default());
        let cue = {
            let recorder = Arc::clone(&recorder);
            ToneCue::new(move || Ok(Box::new(SharedRecorder(Arc::clone(&recorder)))))
        };
        cue.beep(Severity::Critical);
        cue.alarm();

        let played = recorder.played.lock().unwrap();
        assert!(played[1] > played[0] * 3);
    }

    #[test]
    fn test_silent_output() {
        assert!(Silent.play(&[0.5; 10], SAMPLE_RATE).is_ok());
        ToneCue::silent().beep(Severity::Critical);
    }
}
