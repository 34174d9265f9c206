//! reader-speech-rs: text segmentation, cached speech synthesis and document
//! preview generation for a self-hosted document reader.

pub mod api;
pub mod command;
pub mod config;
pub mod documents;
pub mod preview;
pub mod segmenter;
pub mod speech;
pub mod usage;
