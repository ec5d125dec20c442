use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use hound::{SampleFormat, WavSpec, WavWriter};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::plan::{DEFAULT_MAX_SEGMENT_BYTES, SegmentPlan, TimeRange};
use crate::audio::{
    AudioAsset, DecodeError, SourceFormat, decode_window, is_end_of_stream, ms_to_frames,
    open_track,
};

/// Sample rate Whisper models are trained on
pub const DEFAULT_SEGMENT_SAMPLE_RATE: u32 = 16000;

#[derive(Error, Debug)]
pub enum ExportCause {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("WAV encode failed: {0}")]
    Encode(#[from] hound::Error),
    #[error("encoded segment is {size} bytes, above the {limit} byte limit")]
    Oversized { size: u64, limit: u64 },
}

/// Encoding a single segment failed. Already exported segments are not
/// returned to the caller.
#[derive(Error, Debug)]
#[error("Failed to export segment {} of {}: {cause}", .index + 1, .total)]
pub struct ExportError {
    /// 0-based index of the failing segment
    pub index: usize,
    pub total: usize,
    #[source]
    pub cause: ExportCause,
}

/// How segment files are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEncoding {
    /// Copy compressed MPEG audio frames without re-encoding
    Passthrough,
    /// Decode, downmix to mono and write PCM WAV at `sample_rate`, dropping
    /// to a lower rate or 8-bit samples when a segment would not fit the limit
    Wav { sample_rate: u32 },
}

impl SegmentEncoding {
    /// Passthrough for mp3 sources, WAV for everything else
    pub fn for_format(format: &SourceFormat, sample_rate: u32) -> Self {
        match format {
            SourceFormat::Mp3 => SegmentEncoding::Passthrough,
            _ => SegmentEncoding::Wav { sample_rate },
        }
    }

    fn extension<'a>(&self, source: &'a SourceFormat) -> &'a str {
        match self {
            SegmentEncoding::Passthrough => source.extension(),
            SegmentEncoding::Wav { .. } => "wav",
        }
    }
}

const WAV_HEADER_BYTES: u64 = 44;

/// Sample layout of a mono PCM WAV segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// Candidate layouts below `sample_rate`, largest first
    pub fn ladder(sample_rate: u32) -> [PcmFormat; 5] {
        let three_quarters = (sample_rate / 4 * 3).max(1);
        let half = (sample_rate / 2).max(1);
        [
            PcmFormat::new(sample_rate, 16),
            PcmFormat::new(three_quarters, 16),
            PcmFormat::new(half, 16),
            PcmFormat::new(three_quarters, 8),
            PcmFormat::new(half, 8),
        ]
    }

    pub fn new(sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            bits_per_sample,
        }
    }

    /// The last resort of [`PcmFormat::ladder`]
    pub fn smallest(sample_rate: u32) -> Self {
        PcmFormat::new((sample_rate / 2).max(1), 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * (self.bits_per_sample as u64 / 8)
    }

    /// Upper bound of the file size for `duration_ms` of audio, allowing for
    /// resampler rounding at both ends
    pub fn max_file_size(&self, duration_ms: u64) -> u64 {
        let frames = (duration_ms + 1) * self.sample_rate as u64 / 1000 + 2;
        WAV_HEADER_BYTES + frames * (self.bits_per_sample as u64 / 8)
    }

    /// Best layout whose file for `duration_ms` stays within `limit`
    pub fn fit(sample_rate: u32, duration_ms: u64, limit: u64) -> Option<Self> {
        Self::ladder(sample_rate)
            .into_iter()
            .find(|format| format.max_file_size(duration_ms) <= limit)
    }

    fn spec(&self) -> WavSpec {
        WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: SampleFormat::Int,
        }
    }
}

/// A time range of a recording, backed by its own audio file.
///
/// Segments written by [`SegmentExporter`] are removed from disk when dropped
/// unless [`AudioSegment::keep`] was called. A segment standing for a whole,
/// unsplit recording never deletes the recording.
#[derive(Debug)]
pub struct AudioSegment {
    index: usize,
    range: TimeRange,
    path: PathBuf,
    byte_size: u64,
    ephemeral: bool,
}

impl AudioSegment {
    pub fn new(index: usize, range: TimeRange, path: impl Into<PathBuf>, byte_size: u64) -> Self {
        Self {
            index,
            range,
            path: path.into(),
            byte_size,
            ephemeral: false,
        }
    }

    /// The unsplit recording as a single segment
    pub fn whole(asset: &AudioAsset) -> Self {
        Self::new(
            0,
            TimeRange::new(0, asset.duration_ms()),
            asset.path(),
            asset.byte_size(),
        )
    }

    fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn format(&self) -> SourceFormat {
        SourceFormat::from_path(&self.path)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Leave the segment file on disk after the segment is dropped
    pub fn keep(&mut self) {
        self.ephemeral = false;
    }
}

impl Drop for AudioSegment {
    fn drop(&mut self) {
        if !self.ephemeral {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed segment file {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove segment file {:?}: {}", self.path, e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Directory receiving segment files
    pub output_dir: PathBuf,
    /// Segments larger than this are rejected
    pub max_segment_bytes: u64,
    /// Forced encoding; `None` picks one from the source format
    pub encoding: Option<SegmentEncoding>,
    /// Sample rate for WAV segments
    pub sample_rate: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("segments"),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            encoding: None,
            sample_rate: DEFAULT_SEGMENT_SAMPLE_RATE,
        }
    }
}

/// Materializes the ranges of a [`SegmentPlan`] as standalone audio files
#[derive(Debug, Clone)]
pub struct SegmentExporter {
    config: ExportConfig,
}

impl SegmentExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn encoding_for(&self, asset: &AudioAsset) -> SegmentEncoding {
        self.config
            .encoding
            .unwrap_or_else(|| SegmentEncoding::for_format(asset.format(), self.config.sample_rate))
    }

    /// Byte size to plan `asset` against. Re-encoded sources are planned at
    /// no less than the smallest PCM layout, with headroom for WAV headers
    /// and rounding, so that every segment has a layout that fits.
    pub fn planning_size(&self, asset: &AudioAsset) -> u64 {
        match self.encoding_for(asset) {
            SegmentEncoding::Passthrough => asset.byte_size(),
            SegmentEncoding::Wav { sample_rate } => {
                let floor = PcmFormat::smallest(sample_rate).bytes_per_second()
                    * asset.duration_ms()
                    / 1000;
                asset.byte_size().max(floor + floor / 64 + 1024)
            }
        }
    }

    /// `<stem>_part<N>.<ext>` in the output directory, numbered from 1
    pub fn segment_path(&self, asset: &AudioAsset, index: usize) -> PathBuf {
        let encoding = self.encoding_for(asset);
        self.config.output_dir.join(format!(
            "{}_part{}.{}",
            asset.stem(),
            index + 1,
            encoding.extension(asset.format())
        ))
    }

    /// Export every range of `plan`, in order. Stops at the first failure;
    /// segments exported before it are dropped and their files removed.
    pub fn export(
        &self,
        asset: &AudioAsset,
        plan: &SegmentPlan,
    ) -> Result<Vec<AudioSegment>, ExportError> {
        let total = plan.len();
        let mut segments = Vec::with_capacity(total);

        for (index, range) in plan.iter().enumerate() {
            segments.push(self.export_segment(asset, index, total, range)?);
        }

        Ok(segments)
    }

    /// Write one range of `asset` to its own file. The source is only read.
    pub fn export_segment(
        &self,
        asset: &AudioAsset,
        index: usize,
        total: usize,
        range: TimeRange,
    ) -> Result<AudioSegment, ExportError> {
        let fail = |cause: ExportCause| ExportError { index, total, cause };

        fs::create_dir_all(&self.config.output_dir).map_err(|e| fail(e.into()))?;

        let encoding = self.encoding_for(asset);
        let path = self.segment_path(asset, index);
        let started = Instant::now();

        info!(
            "Exporting segment {}/{}: {:.1}s - {:.1}s ({:?})",
            index + 1,
            total,
            range.start_ms as f64 / 1000.0,
            range.end_ms as f64 / 1000.0,
            encoding
        );

        let limit = self.config.max_segment_bytes;
        let written = match encoding {
            SegmentEncoding::Passthrough => write_passthrough(asset.path(), range, &path),
            SegmentEncoding::Wav { sample_rate } => {
                match PcmFormat::fit(sample_rate, range.duration_ms(), limit) {
                    Some(format) => {
                        debug!("Segment {}/{} as {:?}", index + 1, total, format);
                        write_wav(asset.path(), range, &path, format)
                    }
                    None => Err(ExportCause::Oversized {
                        size: PcmFormat::smallest(sample_rate).max_file_size(range.duration_ms()),
                        limit,
                    }),
                }
            }
        };

        let checked = written.and_then(|()| {
            let size = fs::metadata(&path)?.len();
            if size > limit {
                return Err(ExportCause::Oversized { size, limit });
            }
            Ok(size)
        });

        match checked {
            Ok(byte_size) => {
                info!(
                    "Exported segment {}/{} to {:?} ({} bytes) in {:.1}s",
                    index + 1,
                    total,
                    path,
                    byte_size,
                    started.elapsed().as_secs_f32()
                );
                Ok(AudioSegment::new(index, range, path, byte_size).ephemeral())
            }
            Err(cause) => {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial segment {:?}: {}", path, e);
                    }
                }
                Err(fail(cause))
            }
        }
    }
}

/// Copy the packets whose first frame falls inside `range`
fn write_passthrough(source: &Path, range: TimeRange, dest: &Path) -> Result<(), ExportCause> {
    let mut track = open_track(source)?;
    let start = ms_to_frames(range.start_ms, track.sample_rate);
    let end = ms_to_frames(range.end_ms, track.sample_rate);

    if !track.seek_to_frame(start) {
        track = open_track(source)?;
    }

    let mut out = BufWriter::new(File::create(dest)?);

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
        if first_frame < start {
            continue;
        }

        out.write_all(packet.buf())?;
    }

    out.flush()?;
    Ok(())
}

fn write_wav(
    source: &Path,
    range: TimeRange,
    dest: &Path,
    format: PcmFormat,
) -> Result<(), ExportCause> {
    let mut writer = WavWriter::create(dest, format.spec())?;
    let window = range.start_ms..range.end_ms;

    decode_window::<ExportCause, _>(source, window, format.sample_rate, |block| {
        for &sample in block {
            let sample = sample.clamp(-1.0, 1.0);
            if format.bits_per_sample == 8 {
                writer.write_sample((sample * 127.0) as i8)?;
            } else {
                writer.write_sample((sample * 32767.0) as i16)?;
            }
        }
        Ok(())
    })?;

    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::plan_segments;

    fn write_tone(path: &Path, sample_rate: u32, channels: u16, secs: u32) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for n in 0..sample_rate * secs {
            let s = ((n % 100) as i16 - 50) * 200;
            for _ in 0..channels {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    /// MPEG-1 Layer III, 128 kbps, 44.1 kHz frames with silent bodies
    fn write_mp3_frames(path: &Path, frames: usize) -> u64 {
        const FRAME_BYTES: usize = 417;
        let mut frame = vec![0u8; FRAME_BYTES];
        frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x64]);
        let data = frame.repeat(frames);
        fs::write(path, &data).unwrap();
        data.len() as u64
    }

    fn exporter(dir: &Path, max_segment_bytes: u64) -> SegmentExporter {
        SegmentExporter::new(ExportConfig {
            output_dir: dir.join("segments"),
            max_segment_bytes,
            ..Default::default()
        })
    }

    #[test]
    fn test_encoding_follows_source_format() {
        assert_eq!(
            SegmentEncoding::for_format(&SourceFormat::Mp3, 16000),
            SegmentEncoding::Passthrough
        );
        assert_eq!(
            SegmentEncoding::for_format(&SourceFormat::M4a, 16000),
            SegmentEncoding::Wav { sample_rate: 16000 }
        );
    }

    #[test]
    fn test_pcm_format_steps_down_to_fit() {
        assert_eq!(PcmFormat::fit(16000, 1000, 40_000), Some(PcmFormat::new(16000, 16)));
        assert_eq!(PcmFormat::fit(16000, 1500, 40_000), Some(PcmFormat::new(12000, 16)));
        assert_eq!(PcmFormat::fit(16000, 2000, 40_000), Some(PcmFormat::new(8000, 16)));
        assert_eq!(PcmFormat::fit(16000, 3000, 40_000), Some(PcmFormat::new(12000, 8)));
        assert_eq!(PcmFormat::fit(16000, 4000, 40_000), Some(PcmFormat::new(8000, 8)));
        assert_eq!(PcmFormat::fit(16000, 1000, 1_000), None);
        assert_eq!(PcmFormat::smallest(16000).bytes_per_second(), 8000);
    }

    #[test]
    fn test_planning_size_covers_smallest_pcm_layout() {
        let exporter = exporter(Path::new("/tmp/x"), DEFAULT_MAX_SEGMENT_BYTES);

        let mp3 = AudioAsset::from_parts("/music/talk.mp3", 100_000, 60_000);
        assert_eq!(exporter.planning_size(&mp3), 100_000);

        let rich = AudioAsset::from_parts("/music/talk.wav", 10_000_000, 60_000);
        assert_eq!(exporter.planning_size(&rich), 10_000_000);

        // 60 s at 8 kHz 8-bit is 480,000 bytes
        let thin = AudioAsset::from_parts("/music/talk.m4a", 100_000, 60_000);
        assert_eq!(exporter.planning_size(&thin), 480_000 + 7_500 + 1_024);
    }

    #[test]
    fn test_segment_paths_are_numbered_from_one() {
        let exporter = exporter(Path::new("/tmp/x"), DEFAULT_MAX_SEGMENT_BYTES);
        let mp3 = AudioAsset::from_parts("/music/interview.mp3", 1, 1);
        let m4a = AudioAsset::from_parts("/music/interview.m4a", 1, 1);

        assert_eq!(
            exporter.segment_path(&mp3, 0),
            Path::new("/tmp/x/segments/interview_part1.mp3")
        );
        assert_eq!(
            exporter.segment_path(&m4a, 2),
            Path::new("/tmp/x/segments/interview_part3.wav")
        );
    }

    #[test]
    fn test_export_wav_plan_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tone.wav");
        write_tone(&source, 16000, 1, 3);
        let before = fs::read(&source).unwrap();

        let asset = AudioAsset::open(&source).unwrap();
        let plan = plan_segments(asset.byte_size(), asset.duration_ms(), 40_000).unwrap();
        assert_eq!(plan.len(), 3);

        let segments = exporter(dir.path(), 40_000).export(&asset, &plan).unwrap();
        assert_eq!(segments.len(), 3);

        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index(), i);
            assert_eq!(segment.range(), plan.ranges()[i]);
            assert!(segment.is_ephemeral());
            assert_eq!(segment.file_name(), format!("tone_part{}.wav", i + 1));

            let reader = hound::WavReader::open(segment.path()).unwrap();
            assert_eq!(reader.spec().channels, 1);
            assert_eq!(reader.spec().sample_rate, 16000);
            assert_eq!(reader.len(), 16000);
            assert_eq!(segment.byte_size(), fs::metadata(segment.path()).unwrap().len());
        }

        assert_eq!(fs::read(&source).unwrap(), before);
    }

    #[test]
    fn test_export_downmixes_and_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("stereo.wav");
        write_tone(&source, 8000, 2, 2);

        let asset = AudioAsset::open(&source).unwrap();
        let segment = exporter(dir.path(), DEFAULT_MAX_SEGMENT_BYTES)
            .export_segment(&asset, 0, 1, TimeRange::new(0, 1000))
            .unwrap();

        let reader = hound::WavReader::open(segment.path()).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16000);
        assert!((reader.len() as i64 - 16000).abs() <= 2, "got {}", reader.len());
    }

    #[test]
    fn test_long_wav_segment_drops_quality_to_fit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tone.wav");
        write_tone(&source, 16000, 1, 4);
        let asset = AudioAsset::open(&source).unwrap();

        let segment = exporter(dir.path(), 40_000)
            .export_segment(&asset, 0, 1, TimeRange::new(0, 4000))
            .unwrap();

        let reader = hound::WavReader::open(segment.path()).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.spec().bits_per_sample, 8);
        assert!(segment.byte_size() <= 40_000);
        assert!((reader.len() as i64 - 32000).abs() <= 2, "got {}", reader.len());
    }

    #[test]
    fn test_mp3_segments_copy_frames_without_reencoding() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("talk.mp3");
        let source_size = write_mp3_frames(&source, 400);
        let before = fs::read(&source).unwrap();

        let asset = AudioAsset::open(&source).unwrap();
        assert_eq!(asset.format(), &SourceFormat::Mp3);
        assert!(asset.duration_ms() > 10_000);

        let exporter = exporter(dir.path(), 60_000);
        assert_eq!(exporter.encoding_for(&asset), SegmentEncoding::Passthrough);

        let plan = plan_segments(asset.byte_size(), asset.duration_ms(), 60_000).unwrap();
        assert_eq!(plan.len(), 3);
        let segments = exporter.export(&asset, &plan).unwrap();

        let mut total = 0;
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.file_name(), format!("talk_part{}.mp3", i + 1));
            assert!(segment.byte_size() <= 60_000, "segment {} is {}", i + 1, segment.byte_size());
            assert_eq!(segment.byte_size() % 417, 0);
            total += segment.byte_size();
        }
        assert_eq!(total, source_size);
        assert_eq!(fs::read(&source).unwrap(), before);
    }

    #[test]
    fn test_dropped_segments_are_removed_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tone.wav");
        write_tone(&source, 16000, 1, 2);
        let asset = AudioAsset::open(&source).unwrap();
        let exporter = exporter(dir.path(), DEFAULT_MAX_SEGMENT_BYTES);

        let first = exporter
            .export_segment(&asset, 0, 2, TimeRange::new(0, 1000))
            .unwrap();
        let mut second = exporter
            .export_segment(&asset, 1, 2, TimeRange::new(1000, 2000))
            .unwrap();
        second.keep();

        let first_path = first.path().to_path_buf();
        let second_path = second.path().to_path_buf();
        drop(first);
        drop(second);

        assert!(!first_path.exists());
        assert!(second_path.exists());
    }

    #[test]
    fn test_whole_segment_never_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tone.wav");
        write_tone(&source, 16000, 1, 1);
        let asset = AudioAsset::open(&source).unwrap();

        let segment = AudioSegment::whole(&asset);
        assert_eq!(segment.range(), TimeRange::new(0, 1000));
        assert_eq!(segment.byte_size(), asset.byte_size());
        drop(segment);

        assert!(source.exists());
    }

    #[test]
    fn test_oversized_segment_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tone.wav");
        write_tone(&source, 16000, 1, 2);
        let asset = AudioAsset::open(&source).unwrap();
        let exporter = exporter(dir.path(), 1_000);

        let err = exporter
            .export_segment(&asset, 1, 2, TimeRange::new(1000, 2000))
            .unwrap_err();

        assert_eq!(err.index, 1);
        assert!(matches!(err.cause, ExportCause::Oversized { limit: 1_000, .. }));
        assert!(err.to_string().contains("segment 2 of 2"));
        assert!(!exporter.segment_path(&asset, 1).exists());
    }

    #[test]
    fn test_unreadable_source_reports_segment_index() {
        let dir = tempfile::tempdir().unwrap();
        let asset = AudioAsset::from_parts(dir.path().join("gone.wav"), 60_000_000, 60_000);
        let plan = plan_segments(asset.byte_size(), asset.duration_ms(), 25_000_000).unwrap();

        let err = exporter(dir.path(), 25_000_000)
            .export(&asset, &plan)
            .unwrap_err();

        assert_eq!(err.index, 0);
        assert_eq!(err.total, 3);
        assert!(matches!(err.cause, ExportCause::Decode(_)));
    }
}
