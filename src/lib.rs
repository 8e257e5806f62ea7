//! Subweave - resumable per-episode subtitle enrichment
//!
//! Builds derived subtitle tracks (cleaned, English, Russian, glossed and bilingual) for each
//! episode of a series by chunked calls to a text-generation backend, corrects the
//! caption delay against the audio, and muxes everything into the video. Every
//! artifact lives in a cache layer; invalidating a layer clears everything derived
//! from it.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod delay;
pub mod error;
pub mod layers;
pub mod media;
pub mod quality;
pub mod subtitle;
pub mod tracks;
pub mod transcribe;
pub mod translate;
pub mod workflow;
