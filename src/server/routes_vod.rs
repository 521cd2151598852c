//! VOD routing: maps `/vod/<source path>/<filename>` onto the engine.
//!
//! The trailing filename selects the operation:
//! - `index.m3u8` - master playlist
//! - `<quality>.m3u8` - media playlist
//! - `<quality>-NNNNNN.ts|.mp4` - one segment, produced on demand
//! - `<quality>.mp4` - full-video playback

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::playlist::M3U8_CONTENT_TYPE;
use crate::server::AppContext;
use crate::transcode::{FullVideoSource, ServeError};

/// One parsed request filename.
#[derive(Debug, PartialEq, Eq)]
pub enum VodRequest {
    MasterPlaylist,
    MediaPlaylist { quality: String },
    Chunk { quality: String, id: u32 },
    FullVideo { quality: String },
}

/// Parse the trailing filename of a VOD URL.
pub fn parse_filename(name: &str) -> Result<VodRequest, ServeError> {
    if name == "index.m3u8" {
        return Ok(VodRequest::MasterPlaylist);
    }

    if let Some(quality) = name.strip_suffix(".m3u8") {
        if quality.is_empty() {
            return Err(ServeError::MalformedRequest(name.to_string()));
        }
        return Ok(VodRequest::MediaPlaylist {
            quality: quality.to_string(),
        });
    }

    let stem_ext = name
        .strip_suffix(".ts")
        .map(|stem| (stem, true))
        .or_else(|| name.strip_suffix(".mp4").map(|stem| (stem, false)));

    let Some((stem, is_ts)) = stem_ext else {
        return Err(ServeError::MalformedRequest(name.to_string()));
    };

    if let Some((quality, digits)) = stem.rsplit_once('-') {
        // Anything dash-separated must be a well-formed segment name
        if quality.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ServeError::MalformedRequest(name.to_string()));
        }
        let id: u32 = digits
            .parse()
            .map_err(|_| ServeError::MalformedRequest(name.to_string()))?;
        return Ok(VodRequest::Chunk {
            quality: quality.to_string(),
            id,
        });
    }

    if is_ts {
        // Bare .ts without a segment number means nothing
        return Err(ServeError::MalformedRequest(name.to_string()));
    }

    Ok(VodRequest::FullVideo {
        quality: stem.to_string(),
    })
}

fn error_status(err: &ServeError) -> StatusCode {
    match err {
        ServeError::EncoderReplaced => StatusCode::CONFLICT,
        ServeError::WaitTimeout(_) => StatusCode::REQUEST_TIMEOUT,
        ServeError::UnknownQuality(_) | ServeError::ChunkOutOfRange(_) => StatusCode::NOT_FOUND,
        ServeError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        ServeError::Spawn(_) | ServeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn serve_vod(
    State(ctx): State<AppContext>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    match handle(ctx, &path, &headers).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

async fn handle(ctx: AppContext, path: &str, headers: &HeaderMap) -> Result<Response, StatusCode> {
    let (dir, file) = path.rsplit_once('/').ok_or(StatusCode::BAD_REQUEST)?;

    // The wildcard strips the leading slash of the absolute source path
    let source = PathBuf::from(format!("/{}", dir));
    if !source.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }

    let request = parse_filename(file).map_err(|e| {
        tracing::debug!("rejected request {:?}: {}", file, e);
        error_status(&e)
    })?;

    let manager = ctx.registry.get_or_create(&source).await.map_err(|e| {
        tracing::error!("failed to open source {:?}: {:#}", source, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    match request {
        VodRequest::MasterPlaylist => Ok(m3u8_response(manager.master_playlist())),
        VodRequest::MediaPlaylist { quality } => manager
            .media_playlist(&quality)
            .map(m3u8_response)
            .ok_or(StatusCode::NOT_FOUND),
        VodRequest::Chunk { quality, id } => {
            let chunk_path = manager.serve_chunk(&quality, id).await.map_err(|e| {
                tracing::debug!("{}: chunk {} not served: {}", manager.id(), id, e);
                error_status(&e)
            })?;
            chunk_response(&chunk_path).await
        }
        VodRequest::FullVideo { quality } => {
            let source = manager.serve_full_video(&quality).map_err(|e| {
                tracing::error!("{}: full video failed: {}", manager.id(), e);
                error_status(&e)
            })?;
            match source {
                FullVideoSource::Passthrough(file_path) => {
                    file_response(&file_path, headers).await
                }
                FullVideoSource::Pipe(stdout) => Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "video/mp4")
                    .body(Body::from_stream(ReaderStream::new(stdout)))
                    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?),
            }
        }
    }
}

fn m3u8_response(playlist: String) -> Response {
    (
        [(header::CONTENT_TYPE, M3U8_CONTENT_TYPE)],
        playlist,
    )
        .into_response()
}

/// Serve one produced segment from the store.
async fn chunk_response(path: &std::path::Path) -> Result<Response, StatusCode> {
    let file = File::open(path).await.map_err(|e| {
        tracing::error!("failed to open segment {:?}: {}", path, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let size = file
        .metadata()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .len();

    let content_type = segment_content_type(path);
    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size.to_string())
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn segment_content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        _ => "video/MP2T",
    }
}

/// Serve a compatible source file directly with range request support.
async fn file_response(path: &std::path::Path, headers: &HeaderMap) -> Result<Response, StatusCode> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let file_size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| parse_range_header(s, file_size));

    match range {
        Some((start, end)) => {
            let length = end - start + 1;

            let mut file = File::open(path).await.map_err(|_| StatusCode::NOT_FOUND)?;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);

            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, "video/mp4")
                .header(header::CONTENT_LENGTH, length.to_string())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, file_size),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        None => {
            let file = File::open(path).await.map_err(|_| StatusCode::NOT_FOUND)?;

            let stream = ReaderStream::new(file);
            let body = Body::from_stream(stream);

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "video/mp4")
                .header(header::CONTENT_LENGTH, file_size.to_string())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Parse HTTP Range header.
///
/// Supports formats:
/// - bytes=0-499
/// - bytes=500-
/// - bytes=-500 (last 500 bytes)
fn parse_range_header(header: &str, file_size: u64) -> Option<(u64, u64)> {
    let header = header.strip_prefix("bytes=")?;

    let (start, end) = header.split_once('-')?;
    let start = start.trim();
    let end = end.trim();

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500 (last 500 bytes)
        (true, false) => {
            let suffix_len: u64 = end.parse().ok()?;
            let start = file_size.saturating_sub(suffix_len);
            Some((start, file_size - 1))
        }
        // bytes=500- (from 500 to end)
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            if start >= file_size {
                return None;
            }
            Some((start, file_size - 1))
        }
        // bytes=0-499
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start >= file_size {
                return None;
            }
            let end = end.min(file_size - 1);
            if start > end {
                return None;
            }
            Some((start, end))
        }
        // bytes=- (invalid)
        (true, true) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filename_master() {
        assert_eq!(
            parse_filename("index.m3u8").unwrap(),
            VodRequest::MasterPlaylist
        );
    }

    #[test]
    fn test_parse_filename_media_playlist() {
        assert_eq!(
            parse_filename("720p.m3u8").unwrap(),
            VodRequest::MediaPlaylist {
                quality: "720p".to_string()
            }
        );
        assert_eq!(
            parse_filename("max.m3u8").unwrap(),
            VodRequest::MediaPlaylist {
                quality: "max".to_string()
            }
        );
    }

    #[test]
    fn test_parse_filename_chunk() {
        assert_eq!(
            parse_filename("720p-000013.ts").unwrap(),
            VodRequest::Chunk {
                quality: "720p".to_string(),
                id: 13
            }
        );
        assert_eq!(
            parse_filename("max-000000.mp4").unwrap(),
            VodRequest::Chunk {
                quality: "max".to_string(),
                id: 0
            }
        );
    }

    #[test]
    fn test_parse_filename_full_video() {
        assert_eq!(
            parse_filename("max.mp4").unwrap(),
            VodRequest::FullVideo {
                quality: "max".to_string()
            }
        );
    }

    #[test]
    fn test_parse_filename_rejects_garbage() {
        assert!(parse_filename("720p-abc.ts").is_err());
        assert!(parse_filename("720p-.ts").is_err());
        assert!(parse_filename("-000001.ts").is_err());
        assert!(parse_filename("720p.ts").is_err());
        assert!(parse_filename(".m3u8").is_err());
        assert!(parse_filename("segment.webm").is_err());
        // Overflowing segment numbers are malformed, not a panic
        assert!(parse_filename("720p-99999999999999.ts").is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&ServeError::EncoderReplaced),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&ServeError::WaitTimeout(3)),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            error_status(&ServeError::UnknownQuality("999p".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&ServeError::ChunkOutOfRange(31)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&ServeError::MalformedRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_segment_content_type() {
        assert_eq!(
            segment_content_type(std::path::Path::new("/x/720p-000001.ts")),
            "video/MP2T"
        );
        assert_eq!(
            segment_content_type(std::path::Path::new("/x/720p-000001.mp4")),
            "video/mp4"
        );
    }

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_range_header("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range_header("bytes=-200", 1000), Some((800, 999)));
        assert_eq!(parse_range_header("bytes=0-2000", 1000), Some((0, 999)));
        assert_eq!(parse_range_header("bytes=1500-", 1000), None);
        assert_eq!(parse_range_header("bytes=-", 1000), None);
        assert_eq!(parse_range_header("bytes=abc-def", 1000), None);
    }
}
