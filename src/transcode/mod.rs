//! Best-effort adaptive image transcoding.
//!
//! [`Transcoder::transcode`] tries a fixed ladder of lossy/lossless
//! encodings (AVIF, WebP, JPEG) and keeps whichever output is smallest.
//! Vector markup and images narrower than the configured threshold are
//! passed through untouched.  Encoder failures are logged and skipped;
//! the worst case is the original bytes tagged with their sniffed format.

use std::fmt;
use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::{debug, warn};

use crate::config::TranscodeSettings;

/// Encoding of a stored asset payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Svg,
    Avif,
    Webp,
    Jpeg,
    Png,
    Gif,
    /// Unrecognised or undecodable payload.
    Bin,
}

impl FormatTag {
    /// File extension used on disk (`jpeg` is normalised to `jpg`).
    pub fn extension(self) -> &'static str {
        match self {
            Self::Svg => "svg",
            Self::Avif => "avif",
            Self::Webp => "webp",
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Bin => "bin",
        }
    }

    fn from_image_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Avif => Self::Avif,
            ImageFormat::WebP => Self::Webp,
            ImageFormat::Jpeg => Self::Jpeg,
            ImageFormat::Png => Self::Png,
            ImageFormat::Gif => Self::Gif,
            _ => Self::Bin,
        }
    }

    /// Sniff the tag of an untranscoded payload.
    pub fn sniff(bytes: &[u8]) -> Self {
        if is_svg(bytes) {
            return Self::Svg;
        }
        image::guess_format(bytes)
            .map(Self::from_image_format)
            .unwrap_or(Self::Bin)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jpeg => "jpeg",
            other => other.extension(),
        })
    }
}

/// Output of a transcode attempt.
#[derive(Debug, Clone)]
pub struct Transcoded {
    pub bytes: Vec<u8>,
    pub format: FormatTag,
    /// `true` when `bytes` is a re-encoding rather than the input.
    pub reencoded: bool,
}

impl Transcoded {
    fn passthrough(bytes: &[u8], format: FormatTag) -> Self {
        Self {
            bytes: bytes.to_vec(),
            format,
            reencoded: false,
        }
    }
}

/// True when the payload starts (after a BOM and whitespace) with SVG or
/// XML markup that opens an `<svg` element.
pub fn is_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    let head = &head[start..];
    if head.starts_with(b"<svg") {
        return true;
    }
    (head.starts_with(b"<?xml") || head.starts_with(b"<!DOCTYPE svg"))
        && head.windows(4).any(|w| w == b"<svg")
}

/// True when the payload carries a raster image signature or SVG markup.
pub fn looks_like_image(bytes: &[u8]) -> bool {
    is_svg(bytes) || image::guess_format(bytes).is_ok()
}

#[derive(Debug, Clone, Copy)]
enum Candidate {
    Avif,
    Webp,
    Jpeg,
}

impl Candidate {
    const LADDER: [Candidate; 3] = [Candidate::Avif, Candidate::Webp, Candidate::Jpeg];

    fn tag(self) -> FormatTag {
        match self {
            Self::Avif => FormatTag::Avif,
            Self::Webp => FormatTag::Webp,
            Self::Jpeg => FormatTag::Jpeg,
        }
    }
}

/// Stateless image transcoder parameterised by [`TranscodeSettings`].
#[derive(Debug, Clone, Default)]
pub struct Transcoder {
    settings: TranscodeSettings,
}

impl Transcoder {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    /// Pick the smallest acceptable encoding of `bytes`.  Never fails.
    pub fn transcode(&self, bytes: &[u8]) -> Transcoded {
        if is_svg(bytes) {
            return Transcoded::passthrough(bytes, FormatTag::Svg);
        }
        let original = FormatTag::sniff(bytes);
        if !self.settings.enabled {
            return Transcoded::passthrough(bytes, original);
        }

        let width = match probe_width(bytes) {
            Some(w) => w,
            None => return Transcoded::passthrough(bytes, original),
        };
        if width < self.settings.min_width {
            debug!(width, "image below transcode threshold, stored as-is");
            return Transcoded::passthrough(bytes, original);
        }

        let img = match image::load_from_memory(bytes) {
            Ok(img) => img,
            Err(e) => {
                warn!(error = %e, "image decode failed, storing original");
                return Transcoded::passthrough(bytes, FormatTag::Bin);
            }
        };

        let mut best: Option<(Vec<u8>, FormatTag)> = None;
        for candidate in Candidate::LADDER {
            match self.encode(&img, candidate) {
                Ok(out) => {
                    debug!(format = %candidate.tag(), size = out.len(), "candidate encoded");
                    if best.as_ref().map_or(true, |(b, _)| out.len() < b.len()) {
                        best = Some((out, candidate.tag()));
                    }
                }
                Err(e) => {
                    warn!(format = %candidate.tag(), error = %e, "candidate encoding failed");
                }
            }
        }

        match best {
            Some((out, format)) if out.len() < bytes.len() => Transcoded {
                bytes: out,
                format,
                reencoded: true,
            },
            Some(_) => Transcoded::passthrough(bytes, original),
            None => Transcoded::passthrough(bytes, FormatTag::Bin),
        }
    }

    fn encode(&self, img: &DynamicImage, candidate: Candidate) -> image::ImageResult<Vec<u8>> {
        let mut buf = Vec::new();
        match candidate {
            Candidate::Avif => {
                let enc = AvifEncoder::new_with_speed_quality(
                    &mut buf,
                    self.settings.avif_speed,
                    self.settings.avif_quality,
                );
                DynamicImage::ImageRgba8(img.to_rgba8()).write_with_encoder(enc)?;
            }
            Candidate::Webp => {
                let enc = WebPEncoder::new_lossless(&mut buf);
                DynamicImage::ImageRgba8(img.to_rgba8()).write_with_encoder(enc)?;
            }
            Candidate::Jpeg => {
                // JPEG has no alpha channel.
                let enc = JpegEncoder::new_with_quality(&mut buf, self.settings.jpeg_quality);
                DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(enc)?;
            }
        }
        if buf.is_empty() {
            return Err(image::ImageError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "encoder produced no output",
            )));
        }
        Ok(buf)
    }
}

fn probe_width(bytes: &[u8]) -> Option<u32> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    reader.format()?;
    reader.into_dimensions().ok().map(|(w, _)| w)
}
