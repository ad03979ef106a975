//! Resumable LOCO uploads over a trailer session.
//!
//! Uploads are announced on the main session and delivered over a second,
//! independent encrypted session to a trailer endpoint. The two sessions
//! never share key material, and a failed transfer only tears down the
//! trailer side.
//!
//! ```rust,no_run
//! use loco_trailer::{UploadRequest, Uploader};
//! # async fn example(uploader: Uploader, main: loco_session::SessionHandle) -> Result<(), loco_trailer::UploadError> {
//! let request = UploadRequest::new(1234, 2, "photo.jpg", std::fs::read("photo.jpg").unwrap_or_default());
//! let outcome = uploader.upload(&main, &request).await?;
//! println!("uploaded {} bytes: {:?}", outcome.streamed, outcome.complete);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod request;
pub mod upload;

pub use error::{UploadError, UploadPhase};
pub use request::{
    get_trailer_request, post_request, ship_request, MediaInfo, UploadConfig, UploadRequest,
    UploadState, DEFAULT_CHUNK_SIZE,
};
pub use upload::{
    ShipResult, UploadOutcome, Uploader, COMPLETE_METHOD, GET_TRAILER_METHOD, POST_METHOD,
    SHIP_METHOD,
};
