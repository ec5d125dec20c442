//! Audio file introspection and decoding.
//!
//! Probing and decoding go through symphonia so mp3, m4a and wav sources
//! share one code path.

mod asset;
mod decode;

pub use asset::{AssetError, AudioAsset, SourceFormat};
pub use decode::{DecodeError, LinearResampler, decode_window, downmix_into};

pub(crate) use decode::{is_end_of_stream, ms_to_frames, open_track};
