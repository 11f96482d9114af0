//! Worker-side response compression.
//!
//! A response is compressed when all of the following hold: compression is
//! enabled in the pool config, the response is `200 OK` with a non-empty
//! `string` body and no preset `Content-Encoding`, its content type matches
//! the configured pattern, and the request's `Accept-Encoding` advertises a
//! supported encoding. Preference order: brotli (when enabled and accepted),
//! then gzip, then deflate.

use std::io::Write;

use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use regex::Regex;
use spawnpool_proto::{CompressConfig, ResponseBody, ResponseEnvelope, ResponseType, status};

/// Brotli encoder buffer size.
const BROTLI_BUFFER: usize = 4096;
/// Brotli quality (0-11); 5 trades well between ratio and latency.
const BROTLI_QUALITY: u32 = 5;
/// Brotli LZ77 window size, log2.
const BROTLI_LGWIN: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Brotli,
    Gzip,
    Deflate,
}

impl Encoding {
    fn token(self) -> &'static str {
        match self {
            Self::Brotli => "br",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// Compiled compression settings, built once at worker startup.
pub struct Compressor {
    enabled: bool,
    content_match: Option<Regex>,
    brotli: bool,
}

impl Compressor {
    /// Disabled compressor (before `startup` arrives).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            content_match: None,
            brotli: false,
        }
    }

    /// Compile the pool's compression settings. An invalid content-type
    /// pattern disables compression with a warning rather than failing the
    /// worker.
    pub fn from_config(cfg: &CompressConfig) -> Self {
        let content_match = match Regex::new(&cfg.content_match) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(
                    pattern = %cfg.content_match,
                    "invalid compression content-type pattern, compression disabled: {e}"
                );
                return Self::disabled();
            }
        };
        Self {
            enabled: cfg.enabled,
            content_match,
            brotli: cfg.brotli,
        }
    }

    /// Compress `envelope` in place when eligible. A codec failure replaces
    /// the response with a 500.
    pub fn apply(&self, envelope: &mut ResponseEnvelope, accept_encoding: Option<&str>) {
        if !self.enabled || envelope.status != status::OK {
            return;
        }
        if envelope.body_type != ResponseType::String || envelope.body.is_empty() {
            return;
        }
        if header(&envelope.headers, "Content-Encoding").is_some() {
            return;
        }
        let content_type = header(&envelope.headers, "Content-Type").unwrap_or("");
        let Some(re) = &self.content_match else {
            return;
        };
        if !re.is_match(content_type) {
            return;
        }
        let Some(encoding) = self.negotiate(accept_encoding) else {
            return;
        };

        let text = match &envelope.body {
            ResponseBody::Text(s) => s.clone(),
            _ => return,
        };

        match encode(encoding, text.as_bytes()) {
            Ok(compressed) => {
                envelope
                    .headers
                    .insert("Content-Encoding".to_string(), encoding.token().to_string());
                envelope.body = ResponseBody::Binary(compressed.into());
                envelope.body_type = ResponseType::Buffer;
            }
            Err(e) => {
                tracing::error!(id = %envelope.id, "response compression failed: {e}");
                *envelope = ResponseEnvelope::internal_error(
                    envelope.id.clone(),
                    format!("response compression failed: {e}"),
                );
            }
        }
    }

    fn negotiate(&self, accept_encoding: Option<&str>) -> Option<Encoding> {
        let accepted = accept_encoding?;
        let accepts = |token: &str| {
            accepted
                .split(',')
                .map(|t| t.trim().split(';').next().unwrap_or("").trim())
                .any(|t| t.eq_ignore_ascii_case(token) || t == "*")
        };
        if self.brotli && accepts("br") {
            Some(Encoding::Brotli)
        } else if accepts("gzip") {
            Some(Encoding::Gzip)
        } else if accepts("deflate") {
            Some(Encoding::Deflate)
        } else {
            None
        }
    }
}

/// Case-insensitive header lookup.
fn header<'a>(
    headers: &'a std::collections::BTreeMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn encode(encoding: Encoding, input: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(
                    &mut out,
                    BROTLI_BUFFER,
                    BROTLI_QUALITY,
                    BROTLI_LGWIN,
                );
                writer.write_all(input)?;
                writer.flush()?;
            }
            Ok(out)
        }
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(input)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(input)?;
            encoder.finish()
        }
    }
}
