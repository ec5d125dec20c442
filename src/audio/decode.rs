use std::fs::File;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Audio format error: {0}")]
    Format(#[from] SymphoniaError),
    #[error("No audio track found")]
    NoAudioTrack,
    #[error("Sample rate unknown")]
    UnknownSampleRate,
}

/// An opened container positioned on its first audio track.
pub(crate) struct TrackReader {
    pub reader: Box<dyn FormatReader>,
    pub track_id: u32,
    pub params: CodecParameters,
    pub sample_rate: u32,
}

impl TrackReader {
    /// Convert a packet timestamp into sample frames at the track's rate
    pub fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.params.time_base {
            Some(tb) if tb.denom > 0 => {
                let frames = ts as u128 * tb.numer as u128 * self.sample_rate as u128 / tb.denom as u128;
                frames.min(u64::MAX as u128) as u64
            }
            _ => ts,
        }
    }

    /// Convert sample frames into a timestamp in the track's time base
    pub fn frames_to_ts(&self, frames: u64) -> u64 {
        match self.params.time_base {
            Some(tb) if tb.numer > 0 => {
                let ts = frames as u128 * tb.denom as u128 / (tb.numer as u128 * self.sample_rate as u128);
                ts.min(u64::MAX as u128) as u64
            }
            _ => frames,
        }
    }

    /// Seek to `frame`. Returns false when the container refused the seek,
    /// in which case the reader must be reopened.
    pub fn seek_to_frame(&mut self, frame: u64) -> bool {
        if frame == 0 {
            return true;
        }

        let ts = self.frames_to_ts(frame);
        match self.reader.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp { ts, track_id: self.track_id },
        ) {
            Ok(seeked) => {
                debug!("Seeked to ts {} (requested {})", seeked.actual_ts, seeked.required_ts);
                true
            }
            Err(e) => {
                debug!("Seek to frame {} failed, decoding from start: {}", frame, e);
                false
            }
        }
    }
}

/// Probe `path` and open its first decodable audio track
pub(crate) fn open_track(path: &Path) -> Result<TrackReader, DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;
    let track_id = track.id;
    let params = track.codec_params.clone();
    let sample_rate = params.sample_rate.ok_or(DecodeError::UnknownSampleRate)?;

    Ok(TrackReader {
        reader,
        track_id,
        params,
        sample_rate,
    })
}

pub(crate) fn is_end_of_stream(err: &SymphoniaError) -> bool {
    matches!(err, SymphoniaError::IoError(e) if e.kind() == ErrorKind::UnexpectedEof)
}

pub(crate) fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    let frames = ms as u128 * sample_rate as u128 / 1000;
    frames.min(u64::MAX as u128) as u64
}

/// Portion of a packet covering frames `[first, first + frames)` that lies
/// inside `[start, end)`, as `(skip, take)` frame counts.
pub(crate) fn frame_window(first: u64, frames: u64, start: u64, end: u64) -> Option<(usize, usize)> {
    let last = first.saturating_add(frames);
    let lo = first.max(start);
    let hi = last.min(end);
    if lo >= hi {
        return None;
    }
    Some(((lo - first) as usize, (hi - lo) as usize))
}

/// Average interleaved frames down to a single channel
pub fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }

    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

/// Streaming linear-interpolation resampler for mono audio.
///
/// Input may arrive in blocks of any size; the last sample of each block is
/// carried over so interpolation is continuous across block boundaries.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    /// Source samples advanced per output sample
    step: f64,
    /// Next output position, in source samples relative to the carried sample
    position: f64,
    carry: Option<f32>,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            step: source_rate as f64 / target_rate.max(1) as f64,
            position: 0.0,
            carry: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        let carry = self.carry;
        let offset = usize::from(carry.is_some());
        let len = input.len() + offset;
        let sample = |i: usize| -> f32 {
            match carry {
                Some(c) if i == 0 => c,
                _ => input[i - offset],
            }
        };

        while self.position + 1.0 < len as f64 {
            let idx = self.position as usize;
            let frac = (self.position - idx as f64) as f32;
            let a = sample(idx);
            let b = sample(idx + 1);
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        self.carry = Some(sample(len - 1));
        self.position -= (len - 1) as f64;
    }
}

/// Decode the `window_ms` time range of the file at `path` as mono samples at
/// `target_rate`, handing each converted block to `sink`.
///
/// Returns the number of samples delivered.
pub fn decode_window<E, F>(
    path: &Path,
    window_ms: Range<u64>,
    target_rate: u32,
    mut sink: F,
) -> Result<u64, E>
where
    E: From<DecodeError>,
    F: FnMut(&[f32]) -> Result<(), E>,
{
    let mut track = open_track(path)?;
    let start = ms_to_frames(window_ms.start, track.sample_rate);
    let end = ms_to_frames(window_ms.end, track.sample_rate);

    if !track.seek_to_frame(start) {
        track = open_track(path)?;
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.params, &DecoderOptions::default())
        .map_err(DecodeError::from)?;

    let mut resampler = LinearResampler::new(track.sample_rate, target_rate);
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut mono = Vec::new();
    let mut converted = Vec::new();
    let mut delivered = 0u64;

    loop {
        let packet = match track.reader.next_packet() {
            Ok(packet) => packet,
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => return Err(DecodeError::from(e).into()),
        };

        if packet.track_id() != track.track_id {
            continue;
        }

        let first_frame = track.ts_to_frames(packet.ts());
        if first_frame >= end {
            break;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                warn!("Skipping undecodable packet at frame {}: {}", first_frame, reason);
                continue;
            }
            Err(e) => return Err(DecodeError::from(e).into()),
        };

        let Some((skip, take)) = frame_window(first_frame, decoded.frames() as u64, start, end)
        else {
            continue;
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let buf = sample_buf
            .get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec));
        buf.copy_interleaved_ref(decoded);

        let samples = &buf.samples()[skip * channels..(skip + take) * channels];
        mono.clear();
        downmix_into(samples, channels, &mut mono);

        converted.clear();
        resampler.process(&mono, &mut converted);
        delivered += converted.len() as u64;
        sink(&converted)?;
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    fn write_tone(path: &Path, sample_rate: u32, channels: u16, secs: u32) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for n in 0..sample_rate * secs {
            let t = n as f32 / sample_rate as f32;
            let s = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_frame_window() {
        // packet entirely before the window
        assert_eq!(frame_window(0, 100, 100, 200), None);
        // packet straddling the start
        assert_eq!(frame_window(50, 100, 100, 200), Some((50, 50)));
        // packet inside
        assert_eq!(frame_window(120, 50, 100, 200), Some((0, 50)));
        // packet straddling the end
        assert_eq!(frame_window(180, 50, 100, 200), Some((0, 20)));
        // packet after the window
        assert_eq!(frame_window(200, 50, 100, 200), None);
    }

    #[test]
    fn test_downmix_stereo() {
        let mut out = Vec::new();
        downmix_into(&[0.5, -0.5, 1.0, 0.0], 2, &mut out);
        assert_eq!(out, vec![0.0, 0.5]);
    }

    #[test]
    fn test_resampler_passthrough() {
        let mut resampler = LinearResampler::new(16000, 16000);
        let mut out = Vec::new();
        resampler.process(&[0.1, 0.2, 0.3], &mut out);
        assert!(resampler.is_passthrough());
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_resampler_downsample_across_blocks() {
        let input: Vec<f32> = (0..48000).map(|i| i as f32).collect();
        let mut resampler = LinearResampler::new(48000, 16000);
        let mut out = Vec::new();
        for block in input.chunks(1000) {
            resampler.process(block, &mut out);
        }

        assert!((out.len() as i64 - 16000).abs() <= 1, "got {}", out.len());
        // every third source sample, interpolation of a ramp is exact
        assert!((out[1] - 3.0).abs() < 1e-3);
        assert!((out[400] - 1200.0).abs() < 1e-2);
    }

    #[test]
    fn test_resampler_upsample_interpolates() {
        let mut resampler = LinearResampler::new(8000, 16000);
        let mut out = Vec::new();
        resampler.process(&[0.0, 1.0], &mut out);
        resampler.process(&[2.0], &mut out);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_decode_window_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 16000, 2, 3);

        let mut samples = Vec::new();
        let delivered = decode_window::<DecodeError, _>(&path, 1000..2000, 16000, |block| {
            samples.extend_from_slice(block);
            Ok(())
        })
        .unwrap();

        assert_eq!(delivered, 16000);
        assert_eq!(samples.len(), 16000);
        assert!(samples.iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn test_decode_window_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 8000, 1, 2);

        let delivered =
            decode_window::<DecodeError, _>(&path, 0..u64::MAX, 16000, |_| Ok(())).unwrap();
        assert!((delivered as i64 - 32000).abs() <= 2, "got {}", delivered);
    }

    #[test]
    fn test_open_track_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(open_track(&path).is_err());
    }
}
