use lopdf::content::Content;
use lopdf::{Document as LoDocument, Object as LoObject, Stream as LoStream, dictionary};

use crate::compose::{add_image_xobject, op, real};
use crate::compress::progress_percent;
use crate::docmodel::lopdf_err;
use crate::error::DorureError;
use crate::image_data::image_from_bytes;
use crate::types::{MM_TO_PT, Size};

pub const ASSEMBLED_PDF_NAME: &str = "images-converti.pdf";

const IMAGE_RES: &str = "Im1";
const MARGIN_MAX_MM: f32 = 50.0;
const DEFAULT_MARGIN_MM: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    A4,
    Letter,
}

impl PageSize {
    fn dimensions_pt(self) -> (f32, f32) {
        let size = match self {
            PageSize::A4 => Size::a4(),
            PageSize::Letter => Size::letter(),
        };
        (size.width.to_f32(), size.height.to_f32())
    }
}

/// How an image occupies the content box (page minus margins).
/// `Fit` keeps the whole image visible, `Fill` covers the box and lets
/// the page edge crop the overflow, `Stretch` ignores aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    Fit,
    Fill,
    Stretch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssembleOptions {
    pub page_size: PageSize,
    pub mode: FitMode,
    pub margin_mm: f32,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            page_size: PageSize::A4,
            mode: FitMode::Fit,
            margin_mm: DEFAULT_MARGIN_MM,
        }
    }
}

/// Builds a fresh PDF with one page per input image. JPEG and PNG
/// embed as-is; WEBP/GIF/BMP are transcoded to PNG first. Progress is
/// reported after each page; any undecodable input aborts the run.
pub fn assemble(
    images: &[Vec<u8>],
    options: &AssembleOptions,
    mut progress: impl FnMut(u8),
) -> Result<Vec<u8>, DorureError> {
    if images.is_empty() {
        return Err(DorureError::InvalidConfiguration(
            "no images to assemble".to_string(),
        ));
    }
    let (page_w, page_h) = options.page_size.dimensions_pt();
    let margin_pt = options.margin_mm.clamp(0.0, MARGIN_MAX_MM) * MM_TO_PT;
    let content_w = page_w - 2.0 * margin_pt;
    let content_h = page_h - 2.0 * margin_pt;

    let total = images.len();
    let mut out = LoDocument::with_version("1.5");
    let pages_id = out.new_object_id();
    let mut kids: Vec<LoObject> = Vec::with_capacity(total);

    for (index, data) in images.iter().enumerate() {
        let image = image_from_bytes(data, None)?;
        let image_w = image.width.max(1) as f32;
        let image_h = image.height.max(1) as f32;
        let image_id = add_image_xobject(&mut out, image);

        let (draw_w, draw_h) = match options.mode {
            FitMode::Fit => {
                let scale = (content_w / image_w).min(content_h / image_h);
                (image_w * scale, image_h * scale)
            }
            FitMode::Fill => {
                let scale = (content_w / image_w).max(content_h / image_h);
                (image_w * scale, image_h * scale)
            }
            FitMode::Stretch => (content_w, content_h),
        };
        let x = margin_pt + (content_w - draw_w) / 2.0;
        let y = margin_pt + (content_h - draw_h) / 2.0;

        let ops = vec![
            op("q", vec![]),
            op(
                "cm",
                vec![
                    real(draw_w),
                    real(0.0),
                    real(0.0),
                    real(draw_h),
                    real(x),
                    real(y),
                ],
            ),
            op("Do", vec![LoObject::Name(IMAGE_RES.as_bytes().to_vec())]),
            op("Q", vec![]),
        ];
        let encoded = Content { operations: ops }.encode().map_err(lopdf_err)?;
        let content_id = out.add_object(LoStream::new(dictionary! {}, encoded));
        let page_id = out.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), real(page_w), real(page_h)],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { IMAGE_RES => image_id },
            },
        });
        kids.push(page_id.into());
        progress(progress_percent(index + 1, total));
    }

    out.objects.insert(
        pages_id,
        LoObject::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => total as i64,
        }),
    );
    let catalog_id = out.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    out.trailer.set("Root", catalog_id);

    out.prune_objects();
    out.renumber_objects();
    out.compress();
    let mut bytes = Vec::new();
    out.save_to(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{BitmapFormat, PageRasterizer};
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn solid_image(width: u32, height: u32, rgba: [u8; 4], format: ImageFormat) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(rgba));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, format)
            .unwrap();
        out.into_inner()
    }

    fn rendered_rgba(bytes: &[u8], index: usize) -> image::RgbaImage {
        let raster = PageRasterizer::open(bytes).unwrap();
        let png = raster
            .render_page(index, 1.0)
            .unwrap()
            .encode(BitmapFormat::Png, 1.0)
            .unwrap();
        image::load_from_memory(&png).unwrap().to_rgba8()
    }

    fn is_reddish(px: &Rgba<u8>) -> bool {
        px.0[0] > 180 && px.0[1] < 90 && px.0[2] < 90
    }

    fn is_white(px: &Rgba<u8>) -> bool {
        px.0[0] > 240 && px.0[1] > 240 && px.0[2] > 240
    }

    #[test]
    fn empty_input_is_rejected_before_any_work() {
        let err = assemble(&[], &AssembleOptions::default(), |_| {}).unwrap_err();
        assert!(err.to_string().contains("no images"));
    }

    #[test]
    fn one_a4_page_per_image_in_input_order() {
        let images = vec![
            solid_image(100, 50, [255, 0, 0, 255], ImageFormat::Png),
            solid_image(20, 80, [0, 0, 255, 255], ImageFormat::Png),
        ];
        let mut seen: Vec<u8> = Vec::new();
        let bytes = assemble(&images, &AssembleOptions::default(), |pct| seen.push(pct)).unwrap();
        assert_eq!(seen, vec![50, 100]);

        let raster = PageRasterizer::open(&bytes).unwrap();
        assert_eq!(raster.page_count(), 2);
        let size = raster.page_size(0).unwrap();
        assert!((size.width.to_f32() - 595.28).abs() < 0.1);
        assert!((size.height.to_f32() - 841.89).abs() < 0.1);

        // Page order follows input order: red first, blue second.
        let first = rendered_rgba(&bytes, 0);
        let (w, h) = first.dimensions();
        assert!(is_reddish(first.get_pixel(w / 2, h / 2)));
        let second = rendered_rgba(&bytes, 1);
        let center = second.get_pixel(w / 2, h / 2);
        assert!(center.0[2] > 180 && center.0[0] < 90);
    }

    #[test]
    fn fit_keeps_aspect_and_centers_in_the_content_box() {
        // 100x50 source on A4 with 10mm margins: the width-limited fit
        // spans the full content width and half of it in height.
        let images = vec![solid_image(100, 50, [255, 0, 0, 255], ImageFormat::Png)];
        let bytes = assemble(&images, &AssembleOptions::default(), |_| {}).unwrap();
        let img = rendered_rgba(&bytes, 0);
        let (w, h) = img.dimensions();

        assert!(is_reddish(img.get_pixel(w / 2, h / 2)));
        // Left margin stays clear; so does the band above the centered box.
        assert!(is_white(img.get_pixel(10, h / 2)));
        assert!(is_white(img.get_pixel(w / 2, 150)));
        // Just inside the content box on the left edge the image is there.
        assert!(is_reddish(img.get_pixel(35, h / 2)));
    }

    #[test]
    fn stretch_covers_the_whole_content_box() {
        let images = vec![solid_image(20, 80, [255, 0, 0, 255], ImageFormat::Png)];
        let options = AssembleOptions {
            page_size: PageSize::Letter,
            mode: FitMode::Stretch,
            margin_mm: 10.0,
        };
        let bytes = assemble(&images, &options, |_| {}).unwrap();
        let img = rendered_rgba(&bytes, 0);
        let (w, h) = img.dimensions();
        assert_eq!((w, h), (612, 792));

        // Red right up to the margin line on every side, white outside it.
        assert!(is_reddish(img.get_pixel(35, 35)));
        assert!(is_reddish(img.get_pixel(w - 35, h - 35)));
        assert!(is_reddish(img.get_pixel(w / 2, h / 2)));
        assert!(is_white(img.get_pixel(10, 10)));
        assert!(is_white(img.get_pixel(w - 10, h - 10)));
    }

    #[test]
    fn fill_covers_the_box_and_crops_at_the_page_edge() {
        // Tall source on A4 Fill: width is matched to the content box,
        // height overflows into the margins and past the page edge.
        let images = vec![solid_image(20, 200, [255, 0, 0, 255], ImageFormat::Png)];
        let options = AssembleOptions {
            mode: FitMode::Fill,
            ..AssembleOptions::default()
        };
        let bytes = assemble(&images, &options, |_| {}).unwrap();
        let img = rendered_rgba(&bytes, 0);
        let (w, h) = img.dimensions();
        assert!(is_reddish(img.get_pixel(w / 2, 2)));
        assert!(is_reddish(img.get_pixel(w / 2, h - 2)));
        assert!(is_white(img.get_pixel(10, h / 2)));
    }

    #[test]
    fn margin_is_clamped_to_the_supported_range() {
        let images = vec![solid_image(50, 50, [255, 0, 0, 255], ImageFormat::Png)];
        let options = AssembleOptions {
            mode: FitMode::Stretch,
            margin_mm: 500.0,
            ..AssembleOptions::default()
        };
        let bytes = assemble(&images, &options, |_| {}).unwrap();
        let img = rendered_rgba(&bytes, 0);
        let (w, h) = img.dimensions();
        // 50mm margin is ~142pt; everything closer to the edge is blank.
        assert!(is_white(img.get_pixel(100, h / 2)));
        assert!(is_reddish(img.get_pixel(w / 2, h / 2)));
    }

    #[test]
    fn bmp_input_is_transcoded_and_still_renders() {
        let images = vec![solid_image(40, 40, [255, 0, 0, 255], ImageFormat::Bmp)];
        let bytes = assemble(&images, &AssembleOptions::default(), |_| {}).unwrap();
        let img = rendered_rgba(&bytes, 0);
        let (w, h) = img.dimensions();
        assert!(is_reddish(img.get_pixel(w / 2, h / 2)));
    }
}
