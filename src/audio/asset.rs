use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use super::decode::{DecodeError, is_end_of_stream, open_track};

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unreadable audio file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("No audio track found in {0}")]
    NoAudioTrack(PathBuf),
    #[error("Could not determine the duration of {0}")]
    MissingDuration(PathBuf),
    #[error("Unsupported audio format: {0}")]
    Unsupported(String),
}

/// Container format of a source recording, derived from its extension
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Mp3,
    M4a,
    Wav,
    Other(String),
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "mp3" => SourceFormat::Mp3,
            "m4a" | "mp4" | "aac" => SourceFormat::M4a,
            "wav" | "wave" => SourceFormat::Wav,
            _ => SourceFormat::Other(ext),
        }
    }

    pub fn extension(&self) -> &str {
        match self {
            SourceFormat::Mp3 => "mp3",
            SourceFormat::M4a => "m4a",
            SourceFormat::Wav => "wav",
            SourceFormat::Other(ext) => ext,
        }
    }

    /// MIME type used when uploading a file of this format
    pub fn mime_type(&self) -> &'static str {
        match self {
            SourceFormat::Mp3 => "audio/mpeg",
            SourceFormat::M4a => "audio/mp4",
            SourceFormat::Wav => "audio/wav",
            SourceFormat::Other(_) => "application/octet-stream",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// A loaded audio recording. Immutable once opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAsset {
    path: PathBuf,
    byte_size: u64,
    duration_ms: u64,
    format: SourceFormat,
    sample_rate: Option<u32>,
    channels: Option<usize>,
}

impl AudioAsset {
    /// Inspect the file at `path`: size from the filesystem, duration from
    /// the container (or by scanning packets when the header has no length).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AssetError> {
        let path = path.as_ref();
        let byte_size = fs::metadata(path)?.len();
        let format = SourceFormat::from_path(path);

        let mut track = open_track(path).map_err(|e| asset_error(path, e))?;
        let sample_rate = track.sample_rate;
        let channels = track.params.channels.map(|c| c.count());

        let total_frames = match track.params.n_frames {
            Some(frames) => frames,
            None => {
                debug!("No frame count in {:?}, scanning packets", path);
                let mut end_frame = 0u64;
                loop {
                    match track.reader.next_packet() {
                        Ok(packet) if packet.track_id() == track.track_id => {
                            let last = packet.ts().saturating_add(packet.dur());
                            end_frame = end_frame.max(track.ts_to_frames(last));
                        }
                        Ok(_) => {}
                        Err(e) if is_end_of_stream(&e) => break,
                        Err(e) => return Err(asset_error(path, DecodeError::from(e))),
                    }
                }
                if end_frame == 0 {
                    return Err(AssetError::MissingDuration(path.to_path_buf()));
                }
                end_frame
            }
        };
        let duration_ms = (total_frames as u128 * 1000 / sample_rate as u128) as u64;

        info!(
            "Loaded {:?}: {} bytes, {:.1}s, format {}, {} Hz",
            path,
            byte_size,
            duration_ms as f64 / 1000.0,
            format,
            sample_rate
        );

        Ok(Self {
            path: path.to_path_buf(),
            byte_size,
            duration_ms,
            format,
            sample_rate: Some(sample_rate),
            channels,
        })
    }

    /// Build an asset from metadata that was obtained elsewhere
    pub fn from_parts(path: impl Into<PathBuf>, byte_size: u64, duration_ms: u64) -> Self {
        let path = path.into();
        let format = SourceFormat::from_path(&path);
        Self {
            path,
            byte_size,
            duration_ms,
            format,
            sample_rate: None,
            channels: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn format(&self) -> &SourceFormat {
        &self.format
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn channels(&self) -> Option<usize> {
        self.channels
    }

    /// File name without extension, used to name derived files
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio")
            .to_string()
    }

    /// File name as shown to the user
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("audio")
            .to_string()
    }
}

fn asset_error(path: &Path, err: DecodeError) -> AssetError {
    use symphonia::core::errors::Error as SymphoniaError;

    match err {
        DecodeError::Io(e) => AssetError::Io(e),
        DecodeError::NoAudioTrack => AssetError::NoAudioTrack(path.to_path_buf()),
        DecodeError::Format(SymphoniaError::Unsupported(what)) => {
            AssetError::Unsupported(format!("{} ({})", SourceFormat::from_path(path), what))
        }
        other => AssetError::Unreadable {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    fn write_silence(path: &Path, sample_rate: u32, frames: u32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(SourceFormat::from_path(Path::new("a.MP3")), SourceFormat::Mp3);
        assert_eq!(SourceFormat::from_path(Path::new("a.m4a")), SourceFormat::M4a);
        assert_eq!(SourceFormat::from_path(Path::new("a.wav")), SourceFormat::Wav);
        assert_eq!(
            SourceFormat::from_path(Path::new("a.ogg")),
            SourceFormat::Other("ogg".to_string())
        );
        assert_eq!(SourceFormat::Mp3.mime_type(), "audio/mpeg");
    }

    #[test]
    fn test_open_wav_reads_size_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meeting.wav");
        write_silence(&path, 8000, 8000 * 5 / 2);

        let asset = AudioAsset::open(&path).unwrap();
        assert_eq!(asset.duration_ms(), 2500);
        assert_eq!(asset.byte_size(), 44 + 8000 * 5 / 2 * 2);
        assert_eq!(asset.format(), &SourceFormat::Wav);
        assert_eq!(asset.sample_rate(), Some(8000));
        assert_eq!(asset.channels(), Some(1));
        assert_eq!(asset.stem(), "meeting");
        assert_eq!(asset.name(), "meeting.wav");
    }

    #[test]
    fn test_open_missing_file() {
        let err = AudioAsset::open("/nonexistent/recording.mp3").unwrap_err();
        assert!(matches!(err, AssetError::Io(_)));
    }

    #[test]
    fn test_open_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mp3");
        fs::write(&path, vec![0u8; 512]).unwrap();

        assert!(AudioAsset::open(&path).is_err());
    }

    #[test]
    fn test_from_parts() {
        let asset = AudioAsset::from_parts("talk.m4a", 1024, 60_000);
        assert_eq!(asset.format(), &SourceFormat::M4a);
        assert_eq!(asset.duration_ms(), 60_000);
        assert_eq!(asset.sample_rate(), None);
    }
}
