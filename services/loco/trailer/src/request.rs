//! Upload descriptors and request bodies.

use std::time::Duration;

use bytes::Bytes;
use loco_booking::DeviceInfo;
use loco_session::Endpoint;
use loco_wire::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Default size of each streamed write
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Upload tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes handed to the trailer session per write
    pub chunk_size: usize,
    /// Timeout for SHIP, GETTRAILER and POST (seconds)
    pub request_timeout_secs: u64,
    /// How long to wait for COMPLETE after the last byte (seconds)
    pub complete_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout_secs: 10,
            complete_timeout_secs: 120,
        }
    }
}

impl UploadConfig {
    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Completion timeout
    pub fn complete_timeout(&self) -> Duration {
        Duration::from_secs(self.complete_timeout_secs)
    }
}

/// Media dimensions sent with POST when known
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Width in pixels
    pub width: Option<i32>,
    /// Height in pixels
    pub height: Option<i32>,
    /// Duration in seconds
    pub duration: Option<i32>,
}

/// A payload to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Target chat id
    pub chat_id: i64,
    /// Attachment type code
    pub content_type: i32,
    /// File name
    pub filename: String,
    /// File extension without the dot
    pub extension: String,
    /// Payload
    pub data: Bytes,
    /// Optional media dimensions
    pub media: MediaInfo,
}

impl UploadRequest {
    /// Create a request, taking the extension from `filename`
    pub fn new(
        chat_id: i64,
        content_type: i32,
        filename: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let filename = filename.into();
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        Self {
            chat_id,
            content_type,
            filename,
            extension,
            data: data.into(),
            media: MediaInfo::default(),
        }
    }

    /// Attach media dimensions
    pub fn with_media(mut self, media: MediaInfo) -> Self {
        self.media = media;
        self
    }

    /// Payload size
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Lowercase hex SHA-1 of the payload
    pub fn checksum(&self) -> String {
        hex::encode(Sha1::digest(&self.data))
    }
}

/// Progress of one upload; enough to resume from POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadState {
    /// Upload token from SHIP
    pub token: String,
    /// Trailer endpoint
    pub trailer: Endpoint,
    /// Payload size
    pub total_size: u64,
    /// Bytes the trailer already holds
    pub resume_offset: u64,
}

/// SHIP request body
pub fn ship_request(request: &UploadRequest) -> Document {
    doc! {
        "c": request.chat_id,
        "s": request.size() as i64,
        "t": request.content_type,
        "cs": request.checksum(),
        "e": request.extension.as_str(),
    }
}

/// GETTRAILER request body
pub fn get_trailer_request(token: &str, content_type: i32) -> Document {
    doc! { "k": token, "t": content_type }
}

/// POST request body
pub fn post_request(token: &str, request: &UploadRequest, device: &DeviceInfo) -> Document {
    let mut body = doc! {
        "k": token,
        "s": request.size() as i64,
        "f": request.filename.as_str(),
        "t": request.content_type,
        "c": request.chat_id,
    };
    if let Some(width) = request.media.width {
        body.insert("w", width);
    }
    if let Some(height) = request.media.height {
        body.insert("h", height);
    }
    if let Some(duration) = request.media.duration {
        body.insert("d", duration);
    }
    body.insert("u", device.user_id);
    body.insert("os", device.os.as_str());
    body.insert("av", device.app_version.as_str());
    body.insert("nt", device.network_type);
    body.insert("mm", device.mccmnc.clone().unwrap_or_default());
    body
}
