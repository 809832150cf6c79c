//! Image input/output at the request boundary: data URIs, URLs and JPEG.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Read;
use thiserror::Error;

/// JPEG quality used for all encoded results.
pub const JPEG_QUALITY: u8 = 95;

/// Upper bound on a fetched remote image.
const MAX_FETCH_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported image input: {0}")]
    Unsupported(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("image encode failed: {0}")]
    Encode(#[source] image::ImageError),
}

/// Decode an image given as a `data:image/...;base64,` URI or an `http(s)://` URL.
pub fn decode_image_input(input: &str) -> Result<RgbImage, CodecError> {
    let input = input.trim();
    if input.starts_with("data:image") {
        let (header, payload) = input
            .split_once(',')
            .ok_or_else(|| CodecError::Unsupported("data URI without payload".to_string()))?;
        if !header.ends_with(";base64") {
            return Err(CodecError::Unsupported(format!("data URI is not base64: {header}")));
        }
        let bytes = STANDARD.decode(payload.trim())?;
        return decode_image_bytes(&bytes);
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        let bytes = fetch(input)?;
        return decode_image_bytes(&bytes);
    }

    let preview: String = input.chars().take(32).collect();
    Err(CodecError::Unsupported(format!(
        "expected a data:image URI or http(s) URL, got {preview:?}"
    )))
}

fn fetch(url: &str) -> Result<Vec<u8>, CodecError> {
    tracing::debug!(url, "fetching image");
    let response = ureq::get(url).call().map_err(|e| CodecError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_FETCH_BYTES)
        .read_to_end(&mut bytes)
        .map_err(|e| CodecError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

/// Decode encoded image bytes (any format the `image` crate detects) to RGB.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, CodecError> {
    let image = image::load_from_memory(bytes).map_err(CodecError::Decode)?;
    Ok(image.to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(image)
        .map_err(CodecError::Encode)?;
    Ok(buf)
}

/// Encode as JPEG and wrap in a `data:image/jpeg;base64,` URI.
pub fn encode_data_uri(image: &RgbImage) -> Result<String, CodecError> {
    let jpeg = encode_jpeg(image)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample() -> RgbImage {
        RgbImage::from_fn(24, 16, |x, y| Rgb([(x * 10) as u8, (y * 15) as u8, 128]))
    }

    fn png_bytes(image: &RgbImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png_data_uri_is_lossless() {
        let image = sample();
        let uri = format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(&image)));
        assert_eq!(decode_image_input(&uri).unwrap(), image);
    }

    #[test]
    fn test_data_uri_output_decodes_to_same_dimensions() {
        let uri = encode_data_uri(&sample()).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        let decoded = decode_image_input(&uri).unwrap();
        assert_eq!(decoded.dimensions(), (24, 16));
    }

    #[test]
    fn test_plain_string_is_unsupported() {
        assert!(matches!(
            decode_image_input("not-an-image"),
            Err(CodecError::Unsupported(_))
        ));
        assert!(matches!(
            decode_image_input("ftp://example.com/a.png"),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_non_base64_data_uri_is_unsupported() {
        assert!(matches!(
            decode_image_input("data:image/png,rawbytes"),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_bad_payload_errors() {
        assert!(matches!(
            decode_image_input("data:image/png;base64,@@@"),
            Err(CodecError::Base64(_))
        ));
        let garbage = format!("data:image/png;base64,{}", STANDARD.encode(b"hello world"));
        assert!(matches!(decode_image_input(&garbage), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_jpeg_has_soi_marker() {
        let jpeg = encode_jpeg(&sample()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
