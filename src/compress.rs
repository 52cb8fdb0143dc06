use lopdf::content::Content;
use lopdf::{Document as LoDocument, Object as LoObject, Stream as LoStream, dictionary};

use crate::compose::{add_image_xobject, op, real};
use crate::docmodel::lopdf_err;
use crate::error::DorureError;
use crate::image_data::EmbeddableImage;
use crate::raster::{BitmapFormat, PageRasterizer};

const PAGE_IMAGE_RES: &str = "PgIm";

/// Fixed fidelity/size trade-offs for whole-document recompression.
/// The pairs (render scale, JPEG quality) are design constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPreset {
    Light,
    Recommended,
    Maximum,
}

impl CompressionPreset {
    pub fn render_scale(self) -> f32 {
        match self {
            CompressionPreset::Light => 1.5,
            CompressionPreset::Recommended => 1.2,
            CompressionPreset::Maximum => 1.0,
        }
    }

    pub fn jpeg_quality(self) -> f32 {
        match self {
            CompressionPreset::Light => 0.8,
            CompressionPreset::Recommended => 0.6,
            CompressionPreset::Maximum => 0.4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionPreset::Light => "light",
            CompressionPreset::Recommended => "recommended",
            CompressionPreset::Maximum => "maximum",
        }
    }
}

pub(crate) fn progress_percent(done: usize, total: usize) -> u8 {
    ((done as f32 / total.max(1) as f32) * 100.0).round() as u8
}

/// Re-renders every page as a JPEG and rebuilds the document around
/// those bitmaps. Vector content, fonts and form fields of the source
/// are discarded on purpose; page sizes are preserved. Pages are
/// processed in order and any page failure aborts the whole run.
pub fn compress(
    source: &[u8],
    preset: CompressionPreset,
    mut progress: impl FnMut(u8),
) -> Result<Vec<u8>, DorureError> {
    let raster = PageRasterizer::open(source)?;
    let total = raster.page_count();

    let mut out = LoDocument::with_version("1.5");
    let pages_id = out.new_object_id();
    let mut kids: Vec<LoObject> = Vec::with_capacity(total);

    for index in 0..total {
        let size = raster.page_size(index)?;
        let bitmap = raster.render_page(index, preset.render_scale())?;
        let jpeg = bitmap.encode(BitmapFormat::Jpeg, preset.jpeg_quality())?;
        let image_id = add_image_xobject(
            &mut out,
            EmbeddableImage {
                width: bitmap.width(),
                height: bitmap.height(),
                color_space: "DeviceRGB",
                bits_per_component: 8,
                filter: Some("DCTDecode"),
                data: jpeg,
                alpha: None,
            },
        );

        let width_pt = size.width.to_f32();
        let height_pt = size.height.to_f32();
        let ops = vec![
            op("q", vec![]),
            op(
                "cm",
                vec![
                    real(width_pt),
                    real(0.0),
                    real(0.0),
                    real(height_pt),
                    real(0.0),
                    real(0.0),
                ],
            ),
            op("Do", vec![LoObject::Name(PAGE_IMAGE_RES.as_bytes().to_vec())]),
            op("Q", vec![]),
        ];
        let encoded = Content { operations: ops }.encode().map_err(lopdf_err)?;
        let content_id = out.add_object(LoStream::new(dictionary! {}, encoded));
        let page_id = out.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), real(width_pt), real(height_pt)],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { PAGE_IMAGE_RES => image_id },
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

    fn source_pdf(contents: &[&str]) -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<LoObject> = Vec::new();
        for content in contents {
            let content_id = doc.add_object(LoStream::new(
                dictionary! {},
                content.as_bytes().to_vec(),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => contents.len() as i64,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
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

    #[test]
    fn recompressed_document_keeps_page_count_and_geometry() {
        let source = source_pdf(&["0 0 0 rg 100 600 200 50 re f", ""]);
        let out = compress(&source, CompressionPreset::Recommended, |_| {}).unwrap();

        let raster = PageRasterizer::open(&out).unwrap();
        assert_eq!(raster.page_count(), 2);
        let size = raster.page_size(0).unwrap();
        assert!((size.width.to_f32() - 612.0).abs() < 0.1);
        assert!((size.height.to_f32() - 792.0).abs() < 0.1);

        // The black box survives the JPEG round trip at its place.
        let img = rendered_rgba(&out, 0);
        let dark = img.get_pixel(200, 792 - 625);
        assert!(dark.0[0] < 128 && dark.0[1] < 128 && dark.0[2] < 128);
        let light = img.get_pixel(50, 400);
        assert!(light.0[0] > 200 && light.0[1] > 200 && light.0[2] > 200);
    }

    #[test]
    fn progress_runs_in_page_order_to_completion() {
        let source = source_pdf(&["", "", ""]);
        let mut seen: Vec<u8> = Vec::new();
        compress(&source, CompressionPreset::Maximum, |pct| seen.push(pct)).unwrap();
        assert_eq!(seen, vec![33, 67, 100]);
    }

    #[test]
    fn stronger_preset_never_grows_output() {
        let source = source_pdf(&[
            "0.9 0.2 0.1 rg 50 50 500 200 re f \
             0.1 0.4 0.9 rg 80 300 450 300 re f \
             0.2 0.8 0.3 rg 120 620 380 120 re f",
        ]);
        let light = compress(&source, CompressionPreset::Light, |_| {}).unwrap();
        let maximum = compress(&source, CompressionPreset::Maximum, |_| {}).unwrap();
        assert!(light.len() >= maximum.len());
    }

    #[test]
    fn preset_table_matches_design_constants() {
        assert_eq!(CompressionPreset::Light.render_scale(), 1.5);
        assert_eq!(CompressionPreset::Light.jpeg_quality(), 0.8);
        assert_eq!(CompressionPreset::Recommended.render_scale(), 1.2);
        assert_eq!(CompressionPreset::Recommended.jpeg_quality(), 0.6);
        assert_eq!(CompressionPreset::Maximum.render_scale(), 1.0);
        assert_eq!(CompressionPreset::Maximum.jpeg_quality(), 0.4);
        assert_eq!(CompressionPreset::Recommended.name(), "recommended");
    }
}
