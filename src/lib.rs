#![forbid(unsafe_code)]

//! Re-publishes videos on YouTube: a URL goes through yt-dlp, the result is
//! uploaded with the resumable Data API protocol on behalf of an account
//! connected through OAuth2.
//!
//! The server binary wires these modules together; each one is usable on its
//! own.

pub mod config;
pub mod credential;
pub mod downloader;
pub mod error;
pub mod job;
pub mod normalize;
pub mod oauth;
pub mod pipeline;
pub mod secrets;
pub mod security;
pub mod server;
pub mod session;
pub mod upload;

pub use error::{Error, Result};
