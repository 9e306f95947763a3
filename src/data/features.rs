// ============================================================
// Layer 4 — Log-Mel Feature Extractor
// ============================================================
// Converts a 16 kHz waveform into the fixed-size log-mel
// spectrogram the Whisper encoder consumes.
//
//   1. pad with zeros / truncate to chunk_length seconds
//   2. STFT: n_fft=400, hop=160, periodic Hann window,
//      centred frames (reflect padding), power spectrum
//   3. drop the last frame → 3000 frames for 30 s
//   4. Slaney mel filter bank, 0–8000 Hz
//   5. log10(max(x, 1e-10)), clamp to (max - 8), (x + 4) / 4
//
// The FFT plan, window and filter bank are computed once and
// reused for every record.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::domain::{error::DataError, record::AudioArray};

/// Mirrors `preprocessor_config.json` of a Whisper checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtractorConfig {
    #[serde(default = "default_feature_size")]
    pub feature_size:  usize,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    #[serde(default = "default_hop_length")]
    pub hop_length:    usize,
    #[serde(default = "default_chunk_length")]
    pub chunk_length:  usize,
    #[serde(default = "default_n_fft")]
    pub n_fft:         usize,
    #[serde(default)]
    pub padding_value: f32,
}

fn default_feature_size() -> usize { 80 }
fn default_sampling_rate() -> u32 { 16000 }
fn default_hop_length() -> usize { 160 }
fn default_chunk_length() -> usize { 30 }
fn default_n_fft() -> usize { 400 }

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            feature_size:  default_feature_size(),
            sampling_rate: default_sampling_rate(),
            hop_length:    default_hop_length(),
            chunk_length:  default_chunk_length(),
            n_fft:         default_n_fft(),
            padding_value: 0.0,
        }
    }
}

impl FeatureExtractorConfig {
    /// Read `preprocessor_config.json`; fall back to Whisper defaults if absent.
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No '{}', using default feature extractor settings", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Invalid feature extractor config '{}'", path.display()))
    }

    pub fn n_samples(&self) -> usize {
        self.chunk_length * self.sampling_rate as usize
    }

    /// Frames per example after the trailing frame is dropped.
    pub fn n_frames(&self) -> usize {
        self.n_samples() / self.hop_length
    }
}

pub struct LogMelExtractor {
    config:      FeatureExtractorConfig,
    fft:         Arc<dyn Fft<f32>>,
    window:      Vec<f32>,
    // [n_mels, n_freqs], row-major
    mel_filters: Vec<f32>,
    n_freqs:     usize,
}

impl std::fmt::Debug for LogMelExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMelExtractor").field("config", &self.config).finish()
    }
}

impl LogMelExtractor {
    pub fn new(config: FeatureExtractorConfig) -> Self {
        let n_fft   = config.n_fft;
        let n_freqs = n_fft / 2 + 1;
        let fft     = FftPlanner::new().plan_fft_forward(n_fft);

        // Periodic Hann window (torch.hann_window default)
        let window = (0..n_fft)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n_fft as f32).cos()
            })
            .collect();

        let mel_filters = slaney_mel_filter_bank(
            n_freqs,
            config.feature_size,
            0.0,
            8000.0,
            config.sampling_rate,
        );

        Self { config, fft, window, mel_filters, n_freqs }
    }

    pub fn config(&self) -> &FeatureExtractorConfig {
        &self.config
    }

    pub fn n_mels(&self) -> usize {
        self.config.feature_size
    }

    pub fn n_frames(&self) -> usize {
        self.config.n_frames()
    }

    /// Compute `[n_mels, n_frames]` features, row-major.
    pub fn extract(&self, audio: &AudioArray) -> Result<Vec<f32>, DataError> {
        if audio.sampling_rate != self.config.sampling_rate {
            return Err(DataError::UnsupportedSampleRate {
                got:      audio.sampling_rate,
                expected: self.config.sampling_rate,
            });
        }
        if audio.samples.is_empty() {
            return Err(DataError::EmptyAudio);
        }

        let n_samples = self.config.n_samples();
        let mut wave = audio.samples.clone();
        wave.resize(n_samples, self.config.padding_value);

        let power = self.power_spectrogram(&wave);
        let n_frames = self.n_frames();
        let n_mels = self.n_mels();

        let mut mel = vec![0.0f32; n_mels * n_frames];
        for m in 0..n_mels {
            let filter = &self.mel_filters[m * self.n_freqs..(m + 1) * self.n_freqs];
            for t in 0..n_frames {
                let frame = &power[t * self.n_freqs..(t + 1) * self.n_freqs];
                let energy: f32 = filter.iter().zip(frame).map(|(w, p)| w * p).sum();
                mel[m * n_frames + t] = energy.max(1e-10).log10();
            }
        }

        let max = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let floor = max - 8.0;
        for v in mel.iter_mut() {
            *v = (v.max(floor) + 4.0) / 4.0;
        }
        Ok(mel)
    }

    /// Power spectrum per frame, `[n_frames, n_freqs]` row-major, last frame dropped.
    fn power_spectrogram(&self, wave: &[f32]) -> Vec<f32> {
        let n_fft  = self.config.n_fft;
        let hop    = self.config.hop_length;
        let padded = reflect_pad(wave, n_fft / 2);

        let n_frames = self.n_frames();
        let mut power  = vec![0.0f32; n_frames * self.n_freqs];
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];

        for t in 0..n_frames {
            let start = t * hop;
            for (i, b) in buffer.iter_mut().enumerate() {
                *b = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);
            for (k, c) in buffer.iter().take(self.n_freqs).enumerate() {
                power[t * self.n_freqs + k] = c.re * c.re + c.im * c.im;
            }
        }
        power
    }
}

/// Mirror `pad` samples at both ends, excluding the edge sample itself.
fn reflect_pad(wave: &[f32], pad: usize) -> Vec<f32> {
    let n = wave.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    for i in 0..pad {
        out.push(wave[(pad - i).min(n - 1)]);
    }
    out.extend_from_slice(wave);
    for i in 0..pad {
        out.push(wave[n.saturating_sub(2 + i)]);
    }
    out
}

fn hz_to_mel_slaney(hz: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz  = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f64).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz  = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f64).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

/// Triangular filters on the Slaney mel scale, area-normalised.
/// Returns `[n_mels, n_freqs]` row-major.
fn slaney_mel_filter_bank(
    n_freqs:       usize,
    n_mels:        usize,
    min_hz:        f64,
    max_hz:        f64,
    sampling_rate: u32,
) -> Vec<f32> {
    let nyquist = sampling_rate as f64 / 2.0;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| nyquist * i as f64 / (n_freqs - 1) as f64)
        .collect();

    let min_mel = hz_to_mel_slaney(min_hz);
    let max_mel = hz_to_mel_slaney(max_hz);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz_slaney(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut bank = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            let w = lower.min(upper).max(0.0);
            bank[m * n_freqs + k] = (w * enorm) as f32;
        }
    }
    bank
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, secs: f32, rate: u32) -> AudioArray {
        let n = (secs * rate as f32) as usize;
        let samples = (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect();
        AudioArray::new(samples, rate)
    }

    #[test]
    fn test_default_shape_is_80_by_3000() {
        let cfg = FeatureExtractorConfig::default();
        assert_eq!(cfg.n_samples(), 480_000);
        assert_eq!(cfg.n_frames(), 3000);

        let fx = LogMelExtractor::new(cfg);
        let feats = fx.extract(&tone(440.0, 1.0, 16000)).unwrap();
        assert_eq!(feats.len(), 80 * 3000);
    }

    #[test]
    fn test_values_are_within_dynamic_range() {
        let fx = LogMelExtractor::new(FeatureExtractorConfig::default());
        let feats = fx.extract(&tone(1000.0, 2.0, 16000)).unwrap();
        let max = feats.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = feats.iter().copied().fold(f32::INFINITY, f32::min);
        // 8 orders of magnitude → 2.0 after the /4 scaling
        assert!(max - min <= 2.0 + 1e-4);
        assert!(feats.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_wrong_sample_rate_is_rejected() {
        let fx = LogMelExtractor::new(FeatureExtractorConfig::default());
        let err = fx.extract(&tone(440.0, 0.5, 8000)).unwrap_err();
        assert_eq!(err, DataError::UnsupportedSampleRate { got: 8000, expected: 16000 });
    }

    #[test]
    fn test_empty_audio_is_rejected() {
        let fx = LogMelExtractor::new(FeatureExtractorConfig::default());
        let err = fx.extract(&AudioArray::new(Vec::new(), 16000)).unwrap_err();
        assert_eq!(err, DataError::EmptyAudio);
    }

    #[test]
    fn test_filter_bank_rows_are_non_empty() {
        let bank = slaney_mel_filter_bank(201, 80, 0.0, 8000.0, 16000);
        for m in 0..80 {
            let row = &bank[m * 201..(m + 1) * 201];
            assert!(row.iter().any(|&w| w > 0.0), "mel filter {m} is empty");
        }
    }

    #[test]
    fn test_slaney_scale_round_trips() {
        for hz in [0.0, 500.0, 1000.0, 4000.0, 8000.0] {
            let back = mel_to_hz_slaney(hz_to_mel_slaney(hz));
            assert!((back - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn test_reflect_pad() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }
}
