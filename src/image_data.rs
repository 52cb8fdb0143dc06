use crate::error::DorureError;
use base64::Engine;
use image::GenericImageView;

// Image payload ready for XObject embedding. `filter` is `Some("DCTDecode")` for JPEG
// passthrough; `None` means raw 8-bit samples, deflated when the document is compressed
// at save time. `alpha` holds 8-bit DeviceGray soft-mask samples.
#[derive(Debug)]
pub(crate) struct EmbeddableImage {
    pub width: u32,
    pub height: u32,
    pub color_space: &'static str,
    pub bits_per_component: u8,
    pub filter: Option<&'static str>,
    pub data: Vec<u8>,
    pub alpha: Option<Vec<u8>>,
}

fn format_from_mime(mime: &str) -> Option<image::ImageFormat> {
    if mime.contains("png") {
        Some(image::ImageFormat::Png)
    } else if mime.contains("jpeg") || mime.contains("jpg") {
        Some(image::ImageFormat::Jpeg)
    } else if mime.contains("webp") {
        Some(image::ImageFormat::WebP)
    } else if mime.contains("gif") {
        Some(image::ImageFormat::Gif)
    } else if mime.contains("bmp") {
        Some(image::ImageFormat::Bmp)
    } else {
        None
    }
}

fn accepted(format: image::ImageFormat) -> bool {
    matches!(
        format,
        image::ImageFormat::Png
            | image::ImageFormat::Jpeg
            | image::ImageFormat::WebP
            | image::ImageFormat::Gif
            | image::ImageFormat::Bmp
    )
}

// JPEG keeps its compressed bytes and embeds as DCTDecode. Every other accepted format
// is decoded to raw samples, which is the lossless PNG-equivalent embed path; there is
// no native embed for WEBP/GIF/BMP.
pub(crate) fn image_from_bytes(
    data: &[u8],
    mime: Option<&str>,
) -> Result<EmbeddableImage, DorureError> {
    let format = match mime.and_then(format_from_mime) {
        Some(format) => format,
        None => image::guess_format(data).map_err(|_| {
            DorureError::UnsupportedFormat("unrecognized image data".to_string())
        })?,
    };
    if !accepted(format) {
        return Err(DorureError::UnsupportedFormat(format!(
            "image format {:?} is not accepted",
            format
        )));
    }

    let decoded = image::load_from_memory_with_format(data, format)
        .map_err(|err| DorureError::UnsupportedFormat(format!("image decode failed: {err}")))?;
    let (width, height) = decoded.dimensions();

    if format == image::ImageFormat::Jpeg {
        let color_space = match decoded.color() {
            image::ColorType::L8 | image::ColorType::La8 => "DeviceGray",
            _ => "DeviceRGB",
        };
        return Ok(EmbeddableImage {
            width,
            height,
            color_space,
            bits_per_component: 8,
            filter: Some("DCTDecode"),
            data: data.to_vec(),
            alpha: None,
        });
    }

    let rgba = decoded.to_rgba8();
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    let mut has_alpha = false;
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        if a != 255 {
            has_alpha = true;
        }
        rgb.extend_from_slice(&[r, g, b]);
        alpha.push(a);
    }

    Ok(EmbeddableImage {
        width,
        height,
        color_space: "DeviceRGB",
        bits_per_component: 8,
        filter: None,
        data: rgb,
        alpha: if has_alpha { Some(alpha) } else { None },
    })
}

pub(crate) fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    if !uri.starts_with("data:") {
        return None;
    }
    let parts: Vec<&str> = uri.splitn(2, ',').collect();
    if parts.len() != 2 {
        return None;
    }
    let header = parts[0];
    let data_part = parts[1];
    let mime = header
        .trim_start_matches("data:")
        .split(';')
        .next()
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains("base64") {
        base64::engine::general_purpose::STANDARD
            .decode(data_part)
            .ok()?
    } else {
        data_part.as_bytes().to_vec()
    };
    Some((mime, data))
}

pub(crate) fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
