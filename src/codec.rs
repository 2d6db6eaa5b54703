//! Frame codec adapter
//!
//! Producers hand frames over in one of three shapes (base64 text, an uploaded
//! file stream, raw bytes). All of them are normalised to the canonical form
//! kept in the [`FrameStore`](crate::store::FrameStore): base64 text of the
//! encoded image. For delivery the canonical payload is decoded, scaled to a
//! fixed width and re-encoded as JPEG.

use std::borrow::Cow;
use std::fmt;
use std::io;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType};
use thiserror::Error;

use crate::config::RelayConfig;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame is empty")]
    Empty,

    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read upload: {0}")]
    Upload(#[from] io::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("image has zero width or height")]
    EmptyImage,

    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

/// A frame as received from a producer
pub enum FrameInput<'a> {
    /// Image bytes already encoded as base64 text
    Base64(String),
    /// Uploaded file, read to the end before storing
    Upload(BoxStream<'a, io::Result<Bytes>>),
    /// Encoded image bytes (JPEG, PNG, ...)
    Raw(Bytes),
}

impl fmt::Debug for FrameInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameInput::Base64(text) => write!(f, "Base64({} chars)", text.len()),
            FrameInput::Upload(_) => f.write_str("Upload(..)"),
            FrameInput::Raw(raw) => write!(f, "Raw({} bytes)", raw.len()),
        }
    }
}

impl From<String> for FrameInput<'_> {
    fn from(text: String) -> Self {
        FrameInput::Base64(text)
    }
}

impl From<&str> for FrameInput<'_> {
    fn from(text: &str) -> Self {
        FrameInput::Base64(text.to_string())
    }
}

impl From<Bytes> for FrameInput<'_> {
    fn from(raw: Bytes) -> Self {
        FrameInput::Raw(raw)
    }
}

impl From<Vec<u8>> for FrameInput<'_> {
    fn from(raw: Vec<u8>) -> Self {
        FrameInput::Raw(Bytes::from(raw))
    }
}

/// Canonical stored form of a frame (base64 text)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPayload(Bytes);

impl CanonicalPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Drop line breaks and other ASCII whitespace, as found in MIME-wrapped base64
fn strip_ascii_whitespace(payload: &[u8]) -> Cow<'_, [u8]> {
    if payload.iter().any(u8::is_ascii_whitespace) {
        Cow::Owned(
            payload
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect(),
        )
    } else {
        Cow::Borrowed(payload)
    }
}

/// Length of the base64 encoding of `n` raw bytes
fn encoded_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// Converts producer input to canonical payloads and canonical payloads to
/// delivery JPEGs
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub target_width: u32,
    pub jpeg_quality: u8,
    pub max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl FrameCodec {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            target_width: config.target_width,
            jpeg_quality: config.jpeg_quality,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// Normalise any input shape to the canonical payload
    ///
    /// Base64 text is kept as sent; its validity is only checked when the
    /// frame is rendered.
    pub async fn canonicalize(&self, input: FrameInput<'_>) -> Result<CanonicalPayload, CodecError> {
        match input {
            FrameInput::Base64(text) => self.canonicalize_text(text),
            FrameInput::Upload(stream) => {
                let raw = self.read_upload(stream).await?;
                self.canonicalize_raw(&raw)
            }
            FrameInput::Raw(raw) => self.canonicalize_raw(&raw),
        }
    }

    fn canonicalize_text(&self, text: String) -> Result<CanonicalPayload, CodecError> {
        let mut body = text.trim();
        // data:image/jpeg;base64,....
        if body.starts_with("data:") {
            if let Some(idx) = body.find(";base64,") {
                body = &body[idx + ";base64,".len()..];
            }
        }

        if body.is_empty() {
            return Err(CodecError::Empty);
        }

        let wrapped = body.bytes().any(|b| b.is_ascii_whitespace());
        let payload = if !wrapped && body.len() == text.len() {
            Bytes::from(text)
        } else {
            Bytes::from(strip_ascii_whitespace(body.as_bytes()).into_owned())
        };
        Ok(CanonicalPayload(payload))
    }

    fn canonicalize_raw(&self, raw: &[u8]) -> Result<CanonicalPayload, CodecError> {
        if raw.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(CanonicalPayload(Bytes::from(STANDARD.encode(raw))))
    }

    async fn read_upload(
        &self,
        mut stream: BoxStream<'_, io::Result<Bytes>>,
    ) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if encoded_len(buf.len() + chunk.len()) > self.max_frame_bytes {
                return Err(CodecError::TooLarge {
                    limit: self.max_frame_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Decode a canonical payload to a pixel image
    pub fn decode(&self, payload: &[u8]) -> Result<DynamicImage, CodecError> {
        let raw = STANDARD.decode(strip_ascii_whitespace(payload))?;
        let img = image::load_from_memory(&raw).map_err(CodecError::Decode)?;
        if img.width() == 0 || img.height() == 0 {
            return Err(CodecError::EmptyImage);
        }
        Ok(img)
    }

    /// Scale to `target_width`, keeping the aspect ratio
    pub fn resize(&self, img: &DynamicImage) -> DynamicImage {
        let (w, h) = (img.width(), img.height());
        let height = ((h as f64 * self.target_width as f64 / w as f64).round() as u32).max(1);
        img.resize_exact(self.target_width, height, FilterType::Triangle)
    }

    pub fn encode_jpeg(&self, img: &DynamicImage) -> Result<Bytes, CodecError> {
        let rgb = img.to_rgb8();
        let mut out = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, self.jpeg_quality);
            encoder
                .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
                .map_err(CodecError::Encode)?;
        }
        Ok(Bytes::from(out))
    }

    /// Decode, resize and re-encode a canonical payload for delivery
    pub fn render(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let img = self.decode(payload)?;
        let resized = self.resize(&img);
        self.encode_jpeg(&resized)
    }
}
