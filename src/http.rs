//! HTTP response adapter.
//!
//! Serves records over axum. Clients that accept deflate get the record's
//! frames streamed as a zlib stream without recompression or copying;
//! everyone else gets the decompressed body. Strong ETags are set per
//! representation and `If-None-Match` hits short-circuit to `304`.

use std::convert::Infallible;
use std::io::Read;

use axum::body::Body;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream;
use tracing::{debug, warn};

use crate::config::CompressionLevel;
use crate::frame::FrameDescriptor;
use crate::frontend::Frontend;
use crate::key::Key;
use crate::record::STREAM_END;

/// The 2-byte zlib stream header for `level`.
///
/// Byte 0 pins deflate with the default window size; byte 1 carries the
/// level class in its top two bits and is adjusted so the big-endian header
/// value is divisible by 31.
pub(crate) fn zlib_header(level: CompressionLevel) -> [u8; 2] {
    let mut header = [0x78u8, level.zlib_level_bits() << 6];
    header[1] += (31 - u16::from_be_bytes(header) % 31) as u8;
    header
}

/// The 6-byte zlib trailer: empty final deflate block followed by the
/// big-endian Adler-32 of the whole uncompressed content.
pub(crate) fn zlib_trailer(descriptor: FrameDescriptor) -> [u8; 6] {
    let mut trailer = [0u8; 6];
    trailer[..2].copy_from_slice(&STREAM_END);
    trailer[2..].copy_from_slice(&descriptor.checksum.to_be_bytes());
    trailer
}

impl<K: Key> Frontend<K> {
    /// Generate or fetch the record under `key` and render it as an HTTP
    /// response, honoring `Accept-Encoding` and `If-None-Match` from
    /// `headers`.
    ///
    /// Generation runs on the calling thread; from an async handler, call
    /// through `tokio::task::spawn_blocking`.
    pub fn respond(&self, key: K, headers: &HeaderMap) -> Response {
        let record = match self.get(key) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "record generation failed; responding 500");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let deflate = headers
            .get(ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("deflate"));

        let etag = if deflate {
            record.etag().to_owned()
        } else {
            record.etag_decompressed()
        };

        if headers
            .get(IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
            == Some(etag.as_str())
        {
            debug!(outcome = "not_modified", "etag matched");
            return StatusCode::NOT_MODIFIED.into_response();
        }

        let builder = Response::builder().header(ETAG, etag.as_str());
        let result = if deflate {
            // Deflate content encoding is actually the zlib format: frame
            // the record's deflate frames with a zlib header and trailer.
            let mut chunks = vec![Bytes::copy_from_slice(&zlib_header(self.level()))];
            record.push_chunks(&mut chunks);
            chunks.push(Bytes::copy_from_slice(&zlib_trailer(record.descriptor())));

            builder
                .header(CONTENT_ENCODING, "deflate")
                .body(Body::from_stream(stream::iter(
                    chunks.into_iter().map(Ok::<_, Infallible>),
                )))
        } else {
            let mut body = Vec::new();
            let mut reader = record.decompress();
            if let Err(err) = reader.read_to_end(&mut body) {
                warn!(error = %err, "record decompression failed; responding 500");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            builder.body(Body::from(body))
        };
        result.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
