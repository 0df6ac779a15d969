use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::RtpError;

/// G.711 sample rate
pub const TELEPHONY_RATE: u32 = 8000;

/// Streaming converter from a collaborator's sample rate down to 8kHz.
///
/// Input may arrive in arbitrarily sized pieces; `finish` flushes whatever
/// is still buffered at the end of an utterance.
pub struct TelephonyResampler {
    input_rate: u32,
    backend: Backend,
}

enum Backend {
    Passthrough,
    Sinc {
        resampler: SincFixedIn<f32>,
        chunk_size: usize,
        pending: Vec<f32>,
    },
    Linear(LinearResampler),
}

impl TelephonyResampler {
    /// Falls back to linear interpolation if the sinc resampler cannot be built.
    pub fn new(input_rate: u32) -> Result<Self, RtpError> {
        if input_rate == 0 {
            return Err(RtpError::Resample("input sample rate is 0".to_string()));
        }

        let backend = if input_rate == TELEPHONY_RATE {
            Backend::Passthrough
        } else {
            // 20ms of input per processing chunk
            let chunk_size = (input_rate as usize / 50).max(1);
            match build_sinc(input_rate, chunk_size) {
                Ok(resampler) => {
                    tracing::info!(
                        "[Resample] Created resampler: {}Hz → {}Hz, chunk_size={}",
                        input_rate,
                        TELEPHONY_RATE,
                        chunk_size
                    );
                    Backend::Sinc {
                        resampler,
                        chunk_size,
                        pending: Vec::with_capacity(chunk_size * 2),
                    }
                }
                Err(e) => {
                    tracing::warn!("[Resample] {}; using linear interpolation", e);
                    Backend::Linear(LinearResampler::new(input_rate, TELEPHONY_RATE))
                }
            }
        };

        Ok(Self { input_rate, backend })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Convert the next piece of input, returning every 8kHz sample that is ready.
    pub fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, RtpError> {
        match &mut self.backend {
            Backend::Passthrough => Ok(input.to_vec()),
            Backend::Linear(linear) => Ok(linear.process(input)),
            Backend::Sinc {
                resampler,
                chunk_size,
                pending,
            } => {
                pending.extend(input.iter().map(|&s| s as f32 / 32768.0));

                let mut output = Vec::new();
                while pending.len() >= *chunk_size {
                    let chunk = vec![pending.drain(..*chunk_size).collect::<Vec<f32>>()];
                    let frames = resampler
                        .process(&chunk, None)
                        .map_err(|e| RtpError::Resample(format!("{:?}", e)))?;
                    output.extend(to_i16(&frames[0]));
                }
                Ok(output)
            }
        }
    }

    /// Flush buffered input and the filter tail.
    pub fn finish(&mut self) -> Result<Vec<i16>, RtpError> {
        match &mut self.backend {
            Backend::Passthrough | Backend::Linear(_) => Ok(Vec::new()),
            Backend::Sinc {
                resampler, pending, ..
            } => {
                let mut output = Vec::new();
                if !pending.is_empty() {
                    let rest = vec![std::mem::take(pending)];
                    let frames = resampler
                        .process_partial(Some(rest.as_slice()), None)
                        .map_err(|e| RtpError::Resample(format!("{:?}", e)))?;
                    output.extend(to_i16(&frames[0]));
                }
                let tail = resampler
                    .process_partial::<Vec<f32>>(None, None)
                    .map_err(|e| RtpError::Resample(format!("{:?}", e)))?;
                output.extend(to_i16(&tail[0]));
                Ok(output)
            }
        }
    }
}

fn build_sinc(input_rate: u32, chunk_size: usize) -> Result<SincFixedIn<f32>, String> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    SincFixedIn::<f32>::new(
        TELEPHONY_RATE as f64 / input_rate as f64,
        2.0, // max_resample_ratio_relative
        params,
        chunk_size,
        1, // mono channel
    )
    .map_err(|e| format!("Failed to create downsampler: {:?}", e))
}

fn to_i16(samples: &[f32]) -> impl Iterator<Item = i16> + '_ {
    samples
        .iter()
        .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
}

/// Streaming linear interpolator, used when the sinc resampler is unavailable.
///
/// The read position and the last input sample carry over between calls,
/// so chunk boundaries neither drop nor shift output samples.
pub struct LinearResampler {
    step: f64,
    position: f64,
    previous: Option<i16>,
}

impl LinearResampler {
    /// Both rates must be non-zero.
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / output_rate as f64,
            position: 0.0,
            previous: None,
        }
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        let Some(&newest) = input.last() else {
            return Vec::new();
        };

        // Index -1 is the final sample of the previous call
        let previous = self.previous.unwrap_or(input[0]) as f64;
        let last = (input.len() - 1) as f64;
        let mut output = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);

        while self.position < last {
            let index = self.position.floor();
            let frac = self.position - index;
            let left = if index < 0.0 {
                previous
            } else {
                input[index as usize] as f64
            };
            let right = input[(index + 1.0) as usize] as f64;
            output.push((left + (right - left) * frac).round() as i16);
            self.position += self.step;
        }

        self.position -= input.len() as f64;
        self.previous = Some(newest);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(rate: u32, seconds: f64, freq: f64) -> Vec<i16> {
        let count = (rate as f64 * seconds) as usize;
        (0..count)
            .map(|n| {
                let t = n as f64 / rate as f64;
                (8000.0 * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_passthrough_at_8khz() {
        let mut resampler = TelephonyResampler::new(8000).unwrap();
        let input: Vec<i16> = (0..500).map(|i| i as i16).collect();
        assert_eq!(resampler.process(&input).unwrap(), input);
        assert!(resampler.finish().unwrap().is_empty());
    }

    #[test]
    fn test_streaming_downsample_length() {
        let mut resampler = TelephonyResampler::new(16000).unwrap();
        let input = tone(16000, 1.0, 440.0);

        let mut output = Vec::new();
        // Odd-sized pieces, as a network stream would deliver them
        for piece in input.chunks(777) {
            output.extend(resampler.process(piece).unwrap());
        }
        output.extend(resampler.finish().unwrap());

        assert!(
            output.len() >= 7900 && output.len() <= 8500,
            "got {} samples",
            output.len()
        );
    }

    #[test]
    fn test_downsample_keeps_energy() {
        let mut resampler = TelephonyResampler::new(48000).unwrap();
        let input = tone(48000, 0.5, 440.0);

        let mut output = resampler.process(&input).unwrap();
        output.extend(resampler.finish().unwrap());

        // Skip the filter delay at the start
        let settled = &output[400..3600];
        let rms = crate::bargein::rms(settled);
        let expected = 8000.0 / 2f64.sqrt();
        assert!((rms - expected).abs() < expected * 0.1, "rms {}", rms);
    }

    #[test]
    fn test_small_input_buffers_until_finish() {
        let mut resampler = TelephonyResampler::new(16000).unwrap();
        assert!(resampler.process(&[100; 50]).unwrap().is_empty());
        assert!(!resampler.finish().unwrap().is_empty());
    }

    #[test]
    fn test_linear_resampler() {
        let mut resampler = LinearResampler::new(48000, 8000);
        let input: Vec<i16> = (0..960).map(|i| (i * 10) as i16).collect();

        let output = resampler.process(&input);
        assert_eq!(output.len(), 160);
        assert_eq!(output[1], input[6]);
        assert!(resampler.process(&[]).is_empty());
    }

    #[test]
    fn test_linear_chunks_match_whole_input() {
        let input: Vec<i16> = (0..4800).map(|i| ((i * 37) % 2000) as i16).collect();
        let whole = LinearResampler::new(48000, 8000).process(&input);

        let mut chunked = Vec::new();
        let mut resampler = LinearResampler::new(48000, 8000);
        for piece in input.chunks(97) {
            chunked.extend(resampler.process(piece));
        }

        assert_eq!(whole.len(), 800);
        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_linear_fractional_ratio_keeps_rate() {
        let input = tone(44100, 1.0, 300.0);
        let mut resampler = LinearResampler::new(44100, 8000);

        let mut output = Vec::new();
        for piece in input.chunks(400) {
            output.extend(resampler.process(piece));
        }

        assert!((7999..=8000).contains(&output.len()), "got {}", output.len());
    }

    #[test]
    fn test_zero_input_rate_rejected() {
        assert!(matches!(
            TelephonyResampler::new(0),
            Err(RtpError::Resample(_))
        ));
    }
}
