// ============================================================
// Layer 4 — Audio Decoding and Resampling
// ============================================================
// Turns an AudioRef from the dataset into a mono waveform at
// the feature extractor's sample rate.
//
//   WAV file ──hound──▶ interleaved samples
//            ──mix───▶ mono f32 in [-1, 1]
//            ──span──▶ optional start/end cut
//            ──rubato▶ 16 kHz
//
// Errors are DataError values so they can flow through the
// DataLoader unchanged and surface at first access.

use std::path::Path;

use crate::domain::{
    error::DataError,
    record::{AudioArray, AudioRef},
};

/// Decode `audio` and resample it to `target_rate`.
pub fn load_audio(audio: &AudioRef, target_rate: u32) -> Result<AudioArray, DataError> {
    let decoded = read_wav(Path::new(audio.path()))?;
    let (start, end) = audio.span();
    let cut = select_span(decoded, start, end);
    let samples = resample(&cut.samples, cut.sampling_rate, target_rate)?;
    Ok(AudioArray::new(samples, target_rate))
}

/// Read a PCM (int or float) WAV file and down-mix it to mono.
pub fn read_wav(path: &Path) -> Result<AudioArray, DataError> {
    let audio_err = |message: String| DataError::Audio {
        path: path.display().to_string(),
        message,
    };

    let mut reader = hound::WavReader::open(path).map_err(|e| audio_err(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(audio_err("invalid sample rate: 0".to_string()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<_, _>>()
                .map_err(|e| audio_err(e.to_string()))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| audio_err(e.to_string()))?,
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(AudioArray::new(samples, spec.sample_rate))
}

/// Keep only the samples between `start` and `end` seconds.
pub fn select_span(audio: AudioArray, start: Option<f64>, end: Option<f64>) -> AudioArray {
    if start.is_none() && end.is_none() {
        return audio;
    }
    let rate = audio.sampling_rate as f64;
    let len  = audio.samples.len();
    let to_index = |secs: f64| ((secs.max(0.0) * rate).round() as usize).min(len);

    let from  = start.map(to_index).unwrap_or(0);
    let until = end.map(to_index).unwrap_or(len).max(from);

    AudioArray::new(audio.samples[from..until].to_vec(), audio.sampling_rate)
}

/// Resample with FFT-based sinc interpolation.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, DataError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    use rubato::{FftFixedInOut, Resampler};

    let mut resampler = FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, 1024, 1)
        .map_err(|e| DataError::Resample(e.to_string()))?;

    let chunk_size = resampler.input_frames_max();
    let delay = resampler.output_delay();
    let expected_len = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let mut output = Vec::with_capacity(delay + expected_len + resampler.output_frames_max());

    // keep feeding (zeros once the input runs out) until the delayed
    // output covers the whole signal
    let mut chunks = samples.chunks(chunk_size);
    while output.len() < delay + expected_len {
        let mut frames = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        frames.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[frames], None)
            .map_err(|e| DataError::Resample(e.to_string()))?;
        output.extend_from_slice(&result[0]);
    }

    output.drain(..delay);
    output.truncate(expected_len);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_sine_wav;

    #[test]
    fn test_read_mono_wav() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_sine_wav(&path, 16000, 1, 0.25);

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.sampling_rate, 16000);
        assert_eq!(audio.samples.len(), 4000);
        assert!(audio.samples.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_sine_wav(&path, 8000, 2, 0.5);

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.samples.len(), 4000);
    }

    #[test]
    fn test_missing_file_is_audio_error() {
        let err = read_wav(Path::new("/definitely/not/here.wav")).unwrap_err();
        assert!(matches!(err, DataError::Audio { .. }));
    }

    #[test]
    fn test_select_span() {
        let audio = AudioArray::new((0..100).map(|i| i as f32).collect(), 10);
        let cut = select_span(audio, Some(2.0), Some(5.0));
        assert_eq!(cut.samples.len(), 30);
        assert_eq!(cut.samples[0], 20.0);
    }

    #[test]
    fn test_resample_changes_length_proportionally() {
        let samples = vec![0.1f32; 8000];
        let out = resample(&samples, 8000, 16000).unwrap();
        assert_eq!(out.len(), 16000);
    }

    #[test]
    fn test_resample_is_time_aligned() {
        use std::f32::consts::TAU;
        let tone = |rate: f32, n: usize| (0..n).map(|i| (TAU * 440.0 * i as f32 / rate).sin()).collect::<Vec<_>>();

        let out = resample(&tone(8000.0, 8000), 8000, 16000).unwrap();
        let reference = tone(16000.0, 16000);
        assert_eq!(out.len(), reference.len());

        // filter delay removed: away from the edges the tone lines up
        for i in 2000..14000 {
            assert!((out[i] - reference[i]).abs() < 0.05, "sample {i}: {} vs {}", out[i], reference[i]);
        }
    }

    #[test]
    fn test_load_audio_resamples_to_target() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.wav");
        write_sine_wav(&path, 8000, 1, 1.0);

        let audio = load_audio(&AudioRef::Path(path.display().to_string()), 16000).unwrap();
        assert_eq!(audio.sampling_rate, 16000);
        assert_eq!(audio.samples.len(), 16000);
    }
}
