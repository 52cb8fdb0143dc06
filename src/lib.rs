mod assemble;
mod boundary;
mod compose;
mod compress;
mod convert;
mod coords;
mod debug;
mod docmodel;
mod error;
mod flatten;
mod image_data;
mod placement;
mod raster;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

pub use assemble::{ASSEMBLED_PDF_NAME, AssembleOptions, FitMode, PageSize, assemble};
pub use boundary::{
    EntitlementSource, ExportOutput, UsageLedger, export_file_name, pdf_base_name,
};
pub use compose::{ComposeOptions, FieldEdit, FieldValue, compose};
pub use compress::{CompressionPreset, compress};
pub use convert::{
    ConvertedPage, SUPPORTED_EXPORT_DPI, archive_file_name, page_file_name, pages_to_zip,
    pdf_to_images,
};
pub use coords::{to_pdf_space, to_percent_space};
pub use debug::DebugLogger;
pub use docmodel::{Document, FieldKind, FormField, PdfPageRef};
pub use dorure_boundary_contract::{
    Entitlement, ExportAction, ExportRecord, PlanDef, RecordOutcome, SavedSignature,
};
pub use error::DorureError;
pub use placement::{PlacedContent, PlacedItem, PlacedItemKind, PlacementBoard};
pub use raster::{BitmapFormat, PageBitmap, PageRasterizer};
pub use types::{Color, Pt, Size};

const PREVIEW_BASE_SCALE: f32 = 1.5;
const PREVIEW_ZOOM_MIN: f32 = 0.5;
const PREVIEW_ZOOM_MAX: f32 = 2.5;

/// The engine façade. Holds preview defaults, the optional debug log
/// and the two boundary collaborators; every export-class operation
/// checks the entitlement before rendering and records usage after.
pub struct Dorure {
    base_scale: f32,
    debug: Option<DebugLogger>,
    entitlements: Option<Arc<dyn EntitlementSource>>,
    ledger: Option<Arc<dyn UsageLedger>>,
}

impl std::fmt::Debug for Dorure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dorure")
            .field("base_scale", &self.base_scale)
            .field("debug", &self.debug.is_some())
            .field("entitlements", &self.entitlements.is_some())
            .field("ledger", &self.ledger.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct DorureBuilder {
    base_scale: f32,
    debug_path: Option<PathBuf>,
    entitlements: Option<Arc<dyn EntitlementSource>>,
    ledger: Option<Arc<dyn UsageLedger>>,
}

impl DorureBuilder {
    pub fn new() -> Self {
        Self {
            base_scale: PREVIEW_BASE_SCALE,
            debug_path: None,
            entitlements: None,
            ledger: None,
        }
    }

    pub fn base_scale(mut self, scale: f32) -> Self {
        self.base_scale = scale;
        self
    }

    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn entitlement_source(mut self, source: Arc<dyn EntitlementSource>) -> Self {
        self.entitlements = Some(source);
        self
    }

    pub fn usage_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<Dorure, DorureError> {
        if !self.base_scale.is_finite() || self.base_scale <= 0.0 {
            return Err(DorureError::InvalidConfiguration(format!(
                "base_scale must be positive, got {}",
                self.base_scale
            )));
        }
        let debug = match self.debug_path {
            Some(path) => Some(DebugLogger::new(path)?),
            None => None,
        };
        Ok(Dorure {
            base_scale: self.base_scale,
            debug,
            entitlements: self.entitlements,
            ledger: self.ledger,
        })
    }
}

impl Default for DorureBuilder {
    fn default() -> Self {
        DorureBuilder::new()
    }
}

impl Dorure {
    pub fn builder() -> DorureBuilder {
        DorureBuilder::new()
    }

    /// Current entitlement, or the anonymous default when no source is
    /// configured.
    pub fn entitlement(&self) -> Result<Entitlement, DorureError> {
        match &self.entitlements {
            Some(source) => source.entitlement(),
            None => Ok(Entitlement::unauthenticated()),
        }
    }

    /// Whether a placed item may carry a timestamp label right now.
    /// Consulted once at placement time, matching `PlacementBoard::place`.
    pub fn timestamp_allowed(&self) -> bool {
        self.entitlement()
            .map(|entitlement| entitlement.can_use_timestamp)
            .unwrap_or(false)
    }

    pub fn preview_scale(&self, zoom: f32) -> f32 {
        self.base_scale * zoom.clamp(PREVIEW_ZOOM_MIN, PREVIEW_ZOOM_MAX)
    }

    /// PNG preview of one page at the given zoom. Previews are not
    /// export-class: no quota check, nothing recorded.
    pub fn render_preview(
        &self,
        source: &[u8],
        page_index: usize,
        zoom: f32,
    ) -> Result<Vec<u8>, DorureError> {
        let raster = PageRasterizer::open(source)?;
        raster
            .render_page(page_index, self.preview_scale(zoom))?
            .encode(BitmapFormat::Png, 1.0)
    }

    /// Signature export: field edits plus placed overlays, suggested
    /// name `<base>_signe.pdf`.
    pub fn export_signed(
        &self,
        original_name: &str,
        source: &[u8],
        field_edits: &[FieldEdit],
        placed_items: &[PlacedItem],
        options: &ComposeOptions,
    ) -> Result<ExportOutput, DorureError> {
        self.export_composed(
            original_name,
            source,
            field_edits,
            placed_items,
            options,
            ExportAction::Sign,
        )
    }

    /// Form-fill export: field edits only, suggested name
    /// `<base>_rempli.pdf`.
    pub fn export_filled(
        &self,
        original_name: &str,
        source: &[u8],
        field_edits: &[FieldEdit],
        options: &ComposeOptions,
    ) -> Result<ExportOutput, DorureError> {
        self.export_composed(
            original_name,
            source,
            field_edits,
            &[],
            options,
            ExportAction::Fill,
        )
    }

    fn export_composed(
        &self,
        original_name: &str,
        source: &[u8],
        field_edits: &[FieldEdit],
        placed_items: &[PlacedItem],
        options: &ComposeOptions,
        action: ExportAction,
    ) -> Result<ExportOutput, DorureError> {
        self.gate()?;
        let bytes = compose::compose(
            source,
            field_edits,
            placed_items,
            options,
            self.debug.as_ref(),
        )?;
        let file_name = boundary::export_file_name(original_name, action);
        Ok(self.finish_export(original_name, file_name, bytes, action))
    }

    pub fn compress_document(
        &self,
        original_name: &str,
        source: &[u8],
        preset: CompressionPreset,
        progress: impl FnMut(u8),
    ) -> Result<ExportOutput, DorureError> {
        self.gate()?;
        let bytes = compress::compress(source, preset, progress)?;
        let file_name = boundary::export_file_name(original_name, ExportAction::Compress);
        Ok(self.finish_export(original_name, file_name, bytes, ExportAction::Compress))
    }

    /// PDF → image export. A single-page document yields that page's
    /// image file; anything longer yields a ZIP of all pages.
    pub fn convert_to_images(
        &self,
        original_name: &str,
        source: &[u8],
        format: BitmapFormat,
        dpi: u32,
        progress: impl FnMut(u8),
    ) -> Result<ExportOutput, DorureError> {
        self.gate()?;
        let mut pages = convert::pdf_to_images(source, format, dpi, progress)?;
        let base = boundary::pdf_base_name(original_name);
        let (file_name, bytes) = if pages.len() == 1 {
            let page = pages.remove(0);
            (
                convert::page_file_name(base, page.page_number, format),
                page.encoded_bytes,
            )
        } else {
            (
                convert::archive_file_name(base),
                convert::pages_to_zip(base, &pages, format)?,
            )
        };
        Ok(self.finish_export(original_name, file_name, bytes, ExportAction::Convert))
    }

    pub fn assemble_images(
        &self,
        images: &[Vec<u8>],
        options: &AssembleOptions,
        progress: impl FnMut(u8),
    ) -> Result<ExportOutput, DorureError> {
        self.gate()?;
        let bytes = assemble::assemble(images, options, progress)?;
        Ok(self.finish_export(
            ASSEMBLED_PDF_NAME,
            ASSEMBLED_PDF_NAME.to_string(),
            bytes,
            ExportAction::Convert,
        ))
    }

    pub fn saved_signatures(&self) -> Result<Vec<SavedSignature>, DorureError> {
        self.require_ledger()?.saved_signatures()
    }

    pub fn save_signature(
        &self,
        name: &str,
        image_bytes: &[u8],
        mime: &str,
    ) -> Result<String, DorureError> {
        let data_uri = image_data::encode_data_uri(mime, image_bytes);
        self.require_ledger()?.save_signature(name, &data_uri)
    }

    pub fn delete_signature(&self, id: &str) -> Result<bool, DorureError> {
        self.require_ledger()?.delete_signature(id)
    }

    pub fn emit_debug_summary(&self, context: &str) {
        if let Some(debug) = &self.debug {
            debug.emit_summary(context);
            debug.flush();
        }
    }

    fn gate(&self) -> Result<(), DorureError> {
        boundary::ensure_quota(&self.entitlement()?)
    }

    fn finish_export(
        &self,
        original_name: &str,
        file_name: String,
        bytes: Vec<u8>,
        action: ExportAction,
    ) -> ExportOutput {
        let record = boundary::export_record(original_name, &file_name, action, &bytes);
        boundary::record_quietly(self.ledger.as_deref(), &record, self.debug.as_ref());
        ExportOutput { file_name, bytes }
    }

    fn require_ledger(&self) -> Result<&dyn UsageLedger, DorureError> {
        self.ledger.as_deref().ok_or_else(|| {
            DorureError::InvalidConfiguration("no usage ledger configured".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{Document as LoDocument, Object as LoObject, Stream as LoStream, dictionary};
    use std::sync::Mutex;

    fn blank_pdf(page_count: usize) -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<LoObject> = Vec::new();
        for _ in 0..page_count {
            let content_id = doc.add_object(LoStream::new(dictionary! {}, Vec::new()));
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
                "Count" => page_count as i64,
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

    struct PlanSource(Entitlement);

    impl EntitlementSource for PlanSource {
        fn entitlement(&self) -> Result<Entitlement, DorureError> {
            Ok(self.0.clone())
        }
    }

    struct CapturingLedger {
        records: Mutex<Vec<ExportRecord>>,
    }

    impl CapturingLedger {
        fn new() -> Self {
            CapturingLedger {
                records: Mutex::new(Vec::new()),
            }
        }
    }

    impl UsageLedger for CapturingLedger {
        fn record_export(&self, record: &ExportRecord) -> Result<RecordOutcome, DorureError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(RecordOutcome::Recorded { today_count: 1 })
        }

        fn saved_signatures(&self) -> Result<Vec<SavedSignature>, DorureError> {
            Ok(Vec::new())
        }

        fn save_signature(&self, _name: &str, data_uri: &str) -> Result<String, DorureError> {
            Ok(format!("sig:{}", data_uri.len()))
        }

        fn delete_signature(&self, _id: &str) -> Result<bool, DorureError> {
            Ok(true)
        }
    }

    struct OfflineLedger;

    impl UsageLedger for OfflineLedger {
        fn record_export(&self, _record: &ExportRecord) -> Result<RecordOutcome, DorureError> {
            Err(DorureError::Io(std::io::Error::other("offline")))
        }

        fn saved_signatures(&self) -> Result<Vec<SavedSignature>, DorureError> {
            Err(DorureError::Io(std::io::Error::other("offline")))
        }

        fn save_signature(&self, _name: &str, _data_uri: &str) -> Result<String, DorureError> {
            Err(DorureError::Io(std::io::Error::other("offline")))
        }

        fn delete_signature(&self, _id: &str) -> Result<bool, DorureError> {
            Err(DorureError::Io(std::io::Error::other("offline")))
        }
    }

    #[test]
    fn builder_rejects_a_non_positive_base_scale() {
        let err = Dorure::builder().base_scale(0.0).build().unwrap_err();
        assert!(err.to_string().contains("base_scale"));
        assert!(Dorure::builder().base_scale(2.0).build().is_ok());
    }

    #[test]
    fn preview_zoom_is_clamped_around_the_base_scale() {
        let engine = Dorure::builder().build().unwrap();
        assert_eq!(engine.preview_scale(1.0), 1.5);
        assert_eq!(engine.preview_scale(10.0), 1.5 * 2.5);
        assert_eq!(engine.preview_scale(0.01), 1.5 * 0.5);
    }

    #[test]
    fn render_preview_returns_a_png_at_base_scale() {
        let engine = Dorure::builder().build().unwrap();
        let png = engine.render_preview(&blank_pdf(1), 0, 1.0).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let img = image::load_from_memory(&png).unwrap();
        assert_eq!(img.width(), 918); // 612pt * 1.5
    }

    #[test]
    fn quota_gate_fires_before_the_source_is_even_parsed() {
        let spent = Entitlement::evaluate("free", 2);
        let engine = Dorure::builder()
            .entitlement_source(Arc::new(PlanSource(spent)))
            .build()
            .unwrap();
        let err = engine
            .export_filled(
                "doc.pdf",
                b"this is not a pdf",
                &[],
                &ComposeOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, DorureError::QuotaExceeded));
    }

    #[test]
    fn exports_record_usage_with_name_size_and_digest() {
        let ledger = Arc::new(CapturingLedger::new());
        let engine = Dorure::builder()
            .entitlement_source(Arc::new(PlanSource(Entitlement::evaluate("pro", 5))))
            .usage_ledger(ledger.clone())
            .build()
            .unwrap();

        let out = engine
            .export_filled(
                "contrat.pdf",
                &blank_pdf(1),
                &[],
                &ComposeOptions::default(),
            )
            .unwrap();
        assert_eq!(out.file_name, "contrat_rempli.pdf");

        let records = ledger.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ExportAction::Fill);
        assert_eq!(records[0].filename, "contrat_rempli.pdf");
        assert_eq!(records[0].original_name, "contrat.pdf");
        assert_eq!(records[0].kind, "pdf");
        assert_eq!(records[0].size_bytes, out.bytes.len() as u64);
        assert_eq!(records[0].sha256.len(), 64);
    }

    #[test]
    fn a_failing_ledger_never_fails_the_export() {
        let engine = Dorure::builder()
            .usage_ledger(Arc::new(OfflineLedger))
            .build()
            .unwrap();
        let out = engine
            .compress_document(
                "gros.pdf",
                &blank_pdf(1),
                CompressionPreset::Maximum,
                |_| {},
            )
            .unwrap();
        assert_eq!(out.file_name, "gros_compressé.pdf");
    }

    #[test]
    fn conversion_picks_single_file_or_archive_naming() {
        let engine = Dorure::builder().build().unwrap();

        let single = engine
            .convert_to_images("doc.pdf", &blank_pdf(1), BitmapFormat::Jpeg, 72, |_| {})
            .unwrap();
        assert_eq!(single.file_name, "doc_page_1.jpg");
        assert_eq!(&single.bytes[..2], &[0xFF, 0xD8]);

        let archive = engine
            .convert_to_images("doc.pdf", &blank_pdf(3), BitmapFormat::Jpeg, 72, |_| {})
            .unwrap();
        assert_eq!(archive.file_name, "doc_images.zip");
        assert_eq!(&archive.bytes[..2], b"PK");
    }

    #[test]
    fn assembled_documents_use_the_fixed_output_name() {
        let img = {
            let pixels = image::RgbaImage::from_pixel(10, 10, image::Rgba([0, 0, 0, 255]));
            let mut out = std::io::Cursor::new(Vec::new());
            image::DynamicImage::ImageRgba8(pixels)
                .write_to(&mut out, image::ImageFormat::Png)
                .unwrap();
            out.into_inner()
        };
        let engine = Dorure::builder().build().unwrap();
        let out = engine
            .assemble_images(&[img], &AssembleOptions::default(), |_| {})
            .unwrap();
        assert_eq!(out.file_name, "images-converti.pdf");
        assert!(out.bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn signature_library_needs_a_configured_ledger() {
        let bare = Dorure::builder().build().unwrap();
        let err = bare.saved_signatures().unwrap_err();
        assert!(err.to_string().contains("usage ledger"));

        let engine = Dorure::builder()
            .usage_ledger(Arc::new(CapturingLedger::new()))
            .build()
            .unwrap();
        let id = engine
            .save_signature("Paraphe", &[1, 2, 3], "image/png")
            .unwrap();
        assert!(id.starts_with("sig:"));
        assert!(engine.delete_signature(&id).unwrap());
    }

    #[test]
    fn anonymous_sessions_process_without_timestamp_entitlement() {
        let engine = Dorure::builder().build().unwrap();
        assert!(!engine.timestamp_allowed());
        let out = engine
            .export_signed(
                "lettre.pdf",
                &blank_pdf(1),
                &[],
                &[],
                &ComposeOptions::default(),
            )
            .unwrap();
        assert_eq!(out.file_name, "lettre_signe.pdf");
    }
}
