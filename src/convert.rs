use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::compress::progress_percent;
use crate::error::DorureError;
use crate::raster::{BitmapFormat, PageRasterizer};

/// Export resolutions offered to callers. Scale is derived as dpi/72.
pub const SUPPORTED_EXPORT_DPI: [u32; 3] = [72, 150, 300];

const JPEG_EXPORT_QUALITY: f32 = 0.92;

/// One rendered page of a PDF→image conversion run.
#[derive(Debug, Clone)]
pub struct ConvertedPage {
    /// 1-based, matching viewer page numbering.
    pub page_number: usize,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub encoded_bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// Renders every page of `source` at the requested resolution and
/// encodes it in `format`. Pages come back in document order; progress
/// is reported after each page.
pub fn pdf_to_images(
    source: &[u8],
    format: BitmapFormat,
    dpi: u32,
    mut progress: impl FnMut(u8),
) -> Result<Vec<ConvertedPage>, DorureError> {
    if !SUPPORTED_EXPORT_DPI.contains(&dpi) {
        return Err(DorureError::InvalidConfiguration(format!(
            "unsupported export resolution: {dpi} dpi"
        )));
    }
    let raster = PageRasterizer::open(source)?;
    let scale = dpi as f32 / 72.0;
    let total = raster.page_count();
    let mut pages = Vec::with_capacity(total);
    for index in 0..total {
        let bitmap = raster.render_page(index, scale)?;
        let encoded = bitmap.encode(format, JPEG_EXPORT_QUALITY)?;
        pages.push(ConvertedPage {
            page_number: index + 1,
            pixel_width: bitmap.width(),
            pixel_height: bitmap.height(),
            encoded_bytes: encoded,
            mime_type: format.mime_type(),
        });
        progress(progress_percent(index + 1, total));
    }
    Ok(pages)
}

pub fn page_file_name(base: &str, page_number: usize, format: BitmapFormat) -> String {
    format!("{base}_page_{page_number}.{}", format.extension())
}

pub fn archive_file_name(base: &str) -> String {
    format!("{base}_images.zip")
}

/// Packs converted pages into a deflate ZIP, entries at the archive
/// root named `<base>_page_<n>.<ext>`.
pub fn pages_to_zip(
    base: &str,
    pages: &[ConvertedPage],
    format: BitmapFormat,
) -> Result<Vec<u8>, DorureError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for page in pages {
        writer
            .start_file(page_file_name(base, page.page_number, format), options)
            .map_err(zip_err)?;
        writer.write_all(&page.encoded_bytes)?;
    }
    let cursor = writer.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}

fn zip_err(err: zip::result::ZipError) -> DorureError {
    DorureError::Io(std::io::Error::other(err))
}
