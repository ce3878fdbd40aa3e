//! Waveform sequence model for arbitrary waveform generators.
//!
//! ```text
//! Segment ──► Blueprint (one channel) ──► Element (channels in parallel)
//!                                              │
//!                                              ▼
//!                      Sequence (positions, repeats, jumps) ──► UploadPackage ──► file
//! ```
//!
//! Elements and sequences copy what is added to them, so a blueprint can be
//! reused as a template after it was placed.

pub mod blueprint;
pub mod builders;
pub mod codec;
pub mod element;
pub mod segment;
pub mod sequence;
pub mod upload;
pub mod variation;

pub use blueprint::{Blueprint, MarkerSpec, RenderedChannel};
pub use codec::{AwgFileCodec, WaveformEncoder};
pub use element::Element;
pub use segment::{Segment, SegmentArg, SegmentKind};
pub use sequence::{ElementSettings, Sequence, SequenceDescription};
pub use upload::{ChannelWaveform, SequenceTableEntry, UploadPackage};
pub use variation::{repeat_and_vary, vary_sequence, Variation};
