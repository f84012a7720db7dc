use std::{
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, ImageError};
use reqwest::{
    multipart::{Form, Part},
    Body,
};
use shared::{
    domain::MediaType,
    protocol::{is_valid_filename, MAX_ATTACHMENTS_PER_MESSAGE, MAX_ATTACHMENT_BYTES},
};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Images larger than this are downscaled before upload.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1024 * 1024;
pub const MAX_IMAGE_DIMENSION: u32 = 1200;
pub const JPEG_QUALITY: u8 = 80;
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct PendingFile {
    pub filename: String,
    pub data: Vec<u8>,
}

impl PendingFile {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::Validation(format!("{} is not a file", path.display())))?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::Validation(format!("cannot read {}: {e}", path.display())))?;
        Ok(Self { filename, data })
    }

    pub fn media_type(&self) -> MediaType {
        MediaType::infer(&self.filename, None)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub filename: String,
    pub content_type: String,
    pub media_type: MediaType,
    pub data: Vec<u8>,
}

/// Rejects a batch before anything touches the network.
pub fn validate_batch(files: &[PendingFile]) -> ClientResult<()> {
    if files.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(ClientError::Validation(format!(
            "at most {MAX_ATTACHMENTS_PER_MESSAGE} attachments per message"
        )));
    }
    for file in files {
        if !is_valid_filename(&file.filename) {
            return Err(ClientError::Validation(format!(
                "{:?} is not an acceptable file name",
                file.filename
            )));
        }
        if file.data.is_empty() {
            return Err(ClientError::Validation(format!("{} is empty", file.filename)));
        }
        if file.data.len() > MAX_ATTACHMENT_BYTES {
            return Err(ClientError::Validation(format!(
                "{} is larger than 10 MB",
                file.filename
            )));
        }
    }
    Ok(())
}

pub fn prepare_file(file: PendingFile) -> PreparedFile {
    let media_type = file.media_type();
    if media_type == MediaType::Image && file.data.len() > COMPRESSION_THRESHOLD_BYTES {
        match compress_image(&file.data) {
            Ok(data) => {
                debug!(
                    filename = %file.filename,
                    before = file.data.len(),
                    after = data.len(),
                    "image compressed"
                );
                return PreparedFile {
                    filename: jpeg_filename(&file.filename),
                    content_type: "image/jpeg".to_string(),
                    media_type,
                    data,
                };
            }
            Err(error) => {
                warn!(filename = %file.filename, %error, "image could not be decoded; uploading as-is");
            }
        }
    }

    let content_type = mime_guess::from_path(&file.filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    PreparedFile {
        filename: file.filename,
        content_type,
        media_type,
        data: file.data,
    }
}

/// Decodes, bounds the longest side to [`MAX_IMAGE_DIMENSION`] and re-encodes
/// as JPEG.
pub fn compress_image(data: &[u8]) -> Result<Vec<u8>, ImageError> {
    let image = image::load_from_memory(data)?;
    let (width, height) = resize_dimensions(image.width(), image.height(), MAX_IMAGE_DIMENSION);
    let image = if (width, height) == (image.width(), image.height()) {
        image
    } else {
        image.resize_exact(width, height, FilterType::Triangle)
    };

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

/// Scales `(width, height)` so the longest side is at most `max`, keeping the
/// aspect ratio. Never upscales.
pub fn resize_dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max || longest == 0 {
        return (width, height);
    }
    let scale = f64::from(max) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, max);
    (scaled(width), scaled(height))
}

fn jpeg_filename(filename: &str) -> String {
    let stem = filename
        .rsplit_once('.')
        .map_or(filename, |(stem, _)| stem);
    format!("{stem}.jpg")
}

/// Builds one multipart body for the whole batch. Bytes are counted as the
/// transport pulls them and reported as a single percentage.
pub(crate) fn upload_form(
    files: Vec<PreparedFile>,
    progress: Arc<watch::Sender<u8>>,
) -> ClientResult<Form> {
    let total = files.iter().map(|f| f.data.len() as u64).sum::<u64>().max(1);
    let sent = Arc::new(AtomicU64::new(0));

    let mut form = Form::new();
    for file in files {
        let len = file.data.len() as u64;
        let chunks: Vec<Vec<u8>> = file
            .data
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        let sent = Arc::clone(&sent);
        let progress = Arc::clone(&progress);
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            let done = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            report_progress(&progress, done, total);
            Ok::<_, std::io::Error>(chunk)
        }));

        let part = Part::stream_with_length(Body::wrap_stream(stream), len)
            .file_name(file.filename)
            .mime_str(&file.content_type)
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        form = form.part("files", part);
    }
    Ok(form)
}

fn report_progress(progress: &watch::Sender<u8>, done: u64, total: u64) {
    let percent = ((done.saturating_mul(100)) / total).min(100) as u8;
    progress.send_if_modified(|current| {
        if percent > *current {
            *current = percent;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
#[path = "tests/attachments_tests.rs"]
mod tests;
