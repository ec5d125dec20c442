mod capability;
mod openai;
mod sequencer;
#[cfg(feature = "whisper")]
mod whisper;

pub use capability::{CapabilityError, TranscriptionCapability};
pub use openai::{DEFAULT_API_URL, DEFAULT_MODEL, OpenAiTranscriber};
pub use sequencer::{
    ProgressCallback, SegmentProgress, SequenceError, SequencerOptions, TranscriptionSequencer,
};

#[cfg(feature = "whisper")]
pub use whisper::{LocalWhisper, WhisperError, WhisperModel, download_model, is_model_downloaded};
