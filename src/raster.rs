use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageEncoder};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use tiny_skia::{
    FillRule, FilterQuality, LineCap, LineJoin, Mask, Paint, Path, PathBuilder, Pixmap,
    PixmapPaint, Stroke, StrokeDash, Transform,
};
use ttf_parser::{Face, GlyphId, OutlineBuilder};

use crate::docmodel::{lopdf_err, obj_to_f32, page_size_for_id, resolve_object};
use crate::error::DorureError;
use crate::types::{Color, Size};

/// Encoding target for a rendered page. Anything else a caller might
/// name (webp, tiff, ...) is rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapFormat {
    Jpeg,
    Png,
}

impl BitmapFormat {
    pub fn from_name(name: &str) -> Result<BitmapFormat, DorureError> {
        match name
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase()
            .as_str()
        {
            "jpg" | "jpeg" => Ok(BitmapFormat::Jpeg),
            "png" => Ok(BitmapFormat::Png),
            other => Err(DorureError::UnsupportedFormat(format!(
                "output format \"{other}\""
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            BitmapFormat::Jpeg => "jpg",
            BitmapFormat::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            BitmapFormat::Jpeg => "image/jpeg",
            BitmapFormat::Png => "image/png",
        }
    }
}

/// One rendered page. Pixel dimensions are `round(page_pt * scale)` on
/// both axes, over an opaque white background.
#[derive(Debug)]
pub struct PageBitmap {
    pixmap: Pixmap,
}

impl PageBitmap {
    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Encodes to the requested format. JPEG quality is (0,1] mapped to
    /// the codec's 1-100 scale; PNG is lossless and ignores it. JPEG
    /// has no alpha channel, so pixels are composited onto white first.
    pub fn encode(&self, format: BitmapFormat, quality: f32) -> Result<Vec<u8>, DorureError> {
        match format {
            BitmapFormat::Png => self
                .pixmap
                .encode_png()
                .map_err(|err| DorureError::Io(std::io::Error::other(err))),
            BitmapFormat::Jpeg => {
                let width = self.pixmap.width();
                let height = self.pixmap.height();
                let mut rgb = Vec::with_capacity((width as usize) * (height as usize) * 3);
                for px in self.pixmap.pixels() {
                    let c = px.demultiply();
                    let a = c.alpha() as u32;
                    rgb.push(over_white(c.red(), a));
                    rgb.push(over_white(c.green(), a));
                    rgb.push(over_white(c.blue(), a));
                }
                let q = (quality.clamp(0.01, 1.0) * 100.0).round() as u8;
                let mut out = Vec::new();
                let encoder = JpegEncoder::new_with_quality(&mut out, q);
                encoder
                    .write_image(&rgb, width, height, ColorType::Rgb8.into())
                    .map_err(|err| DorureError::Io(std::io::Error::other(err)))?;
                Ok(out)
            }
        }
    }
}

fn over_white(channel: u8, alpha: u32) -> u8 {
    let blended = (channel as u32) * alpha + 255 * (255 - alpha);
    ((blended + 127) / 255) as u8
}

/// Renders pages of one parsed document. The structural reader and
/// this renderer both start from the same raw bytes but keep separate
/// parses; they agree on page order through the page tree.
pub struct PageRasterizer {
    doc: LoDocument,
    page_ids: Vec<ObjectId>,
    sizes: Vec<Size>,
}

impl PageRasterizer {
    pub fn open(bytes: &[u8]) -> Result<PageRasterizer, DorureError> {
        let doc = LoDocument::load_mem(bytes).map_err(lopdf_err)?;
        let page_map = doc.get_pages();
        if page_map.is_empty() {
            return Err(DorureError::MalformedDocument(
                "page tree resolves to zero pages".to_string(),
            ));
        }
        let mut page_ids = Vec::with_capacity(page_map.len());
        let mut sizes = Vec::with_capacity(page_map.len());
        for (_page_no, page_id) in page_map {
            sizes.push(page_size_for_id(&doc, page_id)?);
            page_ids.push(page_id);
        }
        Ok(PageRasterizer {
            doc,
            page_ids,
            sizes,
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    pub fn page_size(&self, page_index: usize) -> Result<Size, DorureError> {
        self.sizes
            .get(page_index)
            .copied()
            .ok_or(DorureError::PageIndexOutOfRange {
                index: page_index,
                page_count: self.page_ids.len(),
            })
    }

    /// Renders one page at the requested scale (1.0 = 72 DPI).
    pub fn render_page(&self, page_index: usize, scale: f32) -> Result<PageBitmap, DorureError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DorureError::InvalidConfiguration(format!(
                "render scale must be positive, got {scale}"
            )));
        }
        let size = self.page_size(page_index)?;
        let page_id = self.page_ids[page_index];
        let width_px = scaled_px(size.width.to_f32(), scale);
        let height_px = scaled_px(size.height.to_f32(), scale);
        let mut pixmap = Pixmap::new(width_px, height_px).ok_or_else(|| {
            DorureError::InvalidConfiguration(format!(
                "invalid raster size {width_px}x{height_px} at scale {scale}"
            ))
        })?;
        pixmap.fill(tiny_skia::Color::from_rgba8(255, 255, 255, 255));

        let page_dict = self
            .doc
            .get_object(page_id)
            .map_err(lopdf_err)?
            .as_dict()
            .map_err(lopdf_err)?;
        let resources = resources_from_page(&self.doc, page_dict)?;
        let content_bytes = self.doc.get_page_content(page_id).map_err(lopdf_err)?;
        let content = Content::decode(&content_bytes).map_err(lopdf_err)?;

        let ctx = RenderContext {
            doc: &self.doc,
            base: Transform::from_row(
                scale,
                0.0,
                0.0,
                -scale,
                0.0,
                size.height.to_f32() * scale,
            ),
            width_px,
            height_px,
        };
        let mut state = GraphicsState::default();
        let mut stack: Vec<GraphicsState> = Vec::new();
        let mut path = PathTracker::default();
        let mut caches = RenderCaches::default();

        render_ops(
            &ctx,
            &content.operations,
            &resources,
            &mut pixmap,
            &mut state,
            &mut stack,
            &mut path,
            &mut caches,
        )?;

        Ok(PageBitmap { pixmap })
    }
}

fn scaled_px(pt: f32, scale: f32) -> u32 {
    (pt * scale).round().max(1.0) as u32
}

#[derive(Clone, Copy, Debug)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }
    }

    fn from_operands(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    fn translation(tx: f32, ty: f32) -> Self {
        Self::from_operands(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    /// Applies `self`, then `rhs`.
    fn concat(self, rhs: Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    fn transform_point(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    fn to_transform(self) -> Transform {
        Transform::from_row(self.a, self.b, self.c, self.d, self.e, self.f)
    }
}

#[derive(Clone)]
struct GraphicsState {
    ctm: Matrix,
    fill_color: Color,
    stroke_color: Color,
    line_width: f32,
    line_cap: u8,
    line_join: u8,
    miter_limit: f32,
    dash_pattern: Vec<f32>,
    dash_phase: f32,
    fill_opacity: f32,
    stroke_opacity: f32,
    clip_mask: Option<Mask>,
    font_resource: Option<String>,
    font_size: f32,
    text_matrix: Matrix,
    text_line_matrix: Matrix,
    text_leading: f32,
    char_spacing: f32,
    word_spacing: f32,
    text_h_scale: f32,
    text_rise: f32,
    text_render_mode: i64,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            ctm: Matrix::identity(),
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: 1.0,
            line_cap: 0,
            line_join: 0,
            miter_limit: 4.0,
            dash_pattern: Vec::new(),
            dash_phase: 0.0,
            fill_opacity: 1.0,
            stroke_opacity: 1.0,
            clip_mask: None,
            font_resource: None,
            font_size: 12.0,
            text_matrix: Matrix::identity(),
            text_line_matrix: Matrix::identity(),
            text_leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            text_h_scale: 1.0,
            text_rise: 0.0,
            text_render_mode: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CodeUnit {
    SingleByte,
    TwoByteBigEndian,
}

impl Default for CodeUnit {
    fn default() -> Self {
        Self::SingleByte
    }
}

#[derive(Clone, Default)]
struct FontWidths {
    default_width: f32,
    widths: HashMap<u16, f32>,
    code_unit: CodeUnit,
}

#[derive(Clone, Default)]
struct FontSlot {
    to_unicode: HashMap<u16, String>,
    program: Option<Arc<Vec<u8>>>,
    metrics: FontWidths,
}

#[derive(Clone, Default)]
struct PageResources {
    fonts: HashMap<String, FontSlot>,
    xobjects: HashMap<String, ObjectId>,
    extgstates: HashMap<String, (f32, f32)>,
}

impl PageResources {
    fn merged(&self, child: &PageResources) -> PageResources {
        let mut out = self.clone();
        for (k, v) in &child.fonts {
            out.fonts.insert(k.clone(), v.clone());
        }
        for (k, v) in &child.xobjects {
            out.xobjects.insert(k.clone(), *v);
        }
        for (k, v) in &child.extgstates {
            out.extgstates.insert(k.clone(), *v);
        }
        out
    }
}

struct RenderContext<'a> {
    doc: &'a LoDocument,
    base: Transform,
    width_px: u32,
    height_px: u32,
}

#[derive(Default)]
struct PathTracker {
    builder: PathBuilder,
    active: bool,
    pending_clip: Option<FillRule>,
}

impl PathTracker {
    fn take(&mut self) -> Option<Path> {
        if !self.active {
            return None;
        }
        self.active = false;
        let builder = std::mem::replace(&mut self.builder, PathBuilder::new());
        builder.finish()
    }
}

#[derive(Default)]
struct RenderCaches {
    images: HashMap<ObjectId, Option<Pixmap>>,
    visited_forms: HashSet<ObjectId>,
}

#[allow(clippy::too_many_arguments)]
fn render_ops(
    ctx: &RenderContext<'_>,
    operations: &[Operation],
    resources: &PageResources,
    pixmap: &mut Pixmap,
    state: &mut GraphicsState,
    stack: &mut Vec<GraphicsState>,
    path: &mut PathTracker,
    caches: &mut RenderCaches,
) -> Result<(), DorureError> {
    for op in operations {
        match op.operator.as_str() {
            "q" => stack.push(state.clone()),
            "Q" => {
                if let Some(prev) = stack.pop() {
                    *state = prev;
                }
            }
            // New transform applies first, then whatever was already in
            // effect.
            "cm" => {
                if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                    state.ctm = Matrix::from_operands(a, b, c, d, e, f).concat(state.ctm);
                }
            }
            "w" => {
                if let Some(width) = op_f32(op, 0) {
                    state.line_width = width.max(0.0);
                }
            }
            "J" => {
                if let Some(cap) = op_i64(op, 0) {
                    state.line_cap = cap.clamp(0, 2) as u8;
                }
            }
            "j" => {
                if let Some(join) = op_i64(op, 0) {
                    state.line_join = join.clamp(0, 2) as u8;
                }
            }
            "M" => {
                if let Some(limit) = op_f32(op, 0) {
                    state.miter_limit = limit.max(0.0);
                }
            }
            "d" => {
                if op.operands.len() >= 2 {
                    state.dash_pattern = op
                        .operands
                        .first()
                        .and_then(|o| o.as_array().ok())
                        .map(|arr| arr.iter().filter_map(obj_to_f32).map(f32::abs).collect())
                        .unwrap_or_default();
                    state.dash_phase = op.operands.get(1).and_then(obj_to_f32).unwrap_or(0.0);
                }
            }
            "gs" => {
                if let Some(name) = op_name(op, 0) {
                    if let Some((fill, stroke)) = resources.extgstates.get(&name).copied() {
                        state.fill_opacity = fill;
                        state.stroke_opacity = stroke;
                    }
                }
            }
            "rg" => {
                if let Some([r, g, b]) = op_f32_3(op) {
                    state.fill_color = Color::rgb(r, g, b);
                }
            }
            "RG" => {
                if let Some([r, g, b]) = op_f32_3(op) {
                    state.stroke_color = Color::rgb(r, g, b);
                }
            }
            "g" => {
                if let Some(gray) = op_f32(op, 0) {
                    state.fill_color = Color::rgb(gray, gray, gray);
                }
            }
            "G" => {
                if let Some(gray) = op_f32(op, 0) {
                    state.stroke_color = Color::rgb(gray, gray, gray);
                }
            }
            "k" => {
                if let Some([c, m, y, k]) = op_f32_4(op) {
                    let (r, g, b) = cmyk_to_rgb(c, m, y, k);
                    state.fill_color = Color::rgb(r, g, b);
                }
            }
            "K" => {
                if let Some([c, m, y, k]) = op_f32_4(op) {
                    let (r, g, b) = cmyk_to_rgb(c, m, y, k);
                    state.stroke_color = Color::rgb(r, g, b);
                }
            }
            "m" => {
                if let Some([x, y]) = op_f32_2(op) {
                    let (px, py) = state.ctm.transform_point(x, y);
                    path.builder.move_to(px, py);
                    path.active = true;
                }
            }
            "l" => {
                if let Some([x, y]) = op_f32_2(op) {
                    let (px, py) = state.ctm.transform_point(x, y);
                    path.builder.line_to(px, py);
                    path.active = true;
                }
            }
            "c" => {
                if let Some([x1, y1, x2, y2, x, y]) = op_f32_6(op) {
                    let (p1x, p1y) = state.ctm.transform_point(x1, y1);
                    let (p2x, p2y) = state.ctm.transform_point(x2, y2);
                    let (px, py) = state.ctm.transform_point(x, y);
                    path.builder.cubic_to(p1x, p1y, p2x, p2y, px, py);
                    path.active = true;
                }
            }
            "re" => {
                if let Some([x, y, w, h]) = op_f32_4(op) {
                    let p0 = state.ctm.transform_point(x, y);
                    let p1 = state.ctm.transform_point(x + w, y);
                    let p2 = state.ctm.transform_point(x + w, y + h);
                    let p3 = state.ctm.transform_point(x, y + h);
                    path.builder.move_to(p0.0, p0.1);
                    path.builder.line_to(p1.0, p1.1);
                    path.builder.line_to(p2.0, p2.1);
                    path.builder.line_to(p3.0, p3.1);
                    path.builder.close();
                    path.active = true;
                }
            }
            "h" => {
                if path.active {
                    path.builder.close();
                }
            }
            // Clip takes effect after the next painting operator.
            "W" => path.pending_clip = Some(FillRule::Winding),
            "W*" => path.pending_clip = Some(FillRule::EvenOdd),
            "f" | "F" => paint_path(ctx, pixmap, state, path, PaintOp::Fill(FillRule::Winding)),
            "f*" => paint_path(ctx, pixmap, state, path, PaintOp::Fill(FillRule::EvenOdd)),
            "S" => paint_path(ctx, pixmap, state, path, PaintOp::Stroke),
            "B" => paint_path(
                ctx,
                pixmap,
                state,
                path,
                PaintOp::FillStroke(FillRule::Winding),
            ),
            "B*" => paint_path(
                ctx,
                pixmap,
                state,
                path,
                PaintOp::FillStroke(FillRule::EvenOdd),
            ),
            "s" => {
                if path.active {
                    path.builder.close();
                }
                paint_path(ctx, pixmap, state, path, PaintOp::Stroke);
            }
            "b" => {
                if path.active {
                    path.builder.close();
                }
                paint_path(
                    ctx,
                    pixmap,
                    state,
                    path,
                    PaintOp::FillStroke(FillRule::Winding),
                );
            }
            "b*" => {
                if path.active {
                    path.builder.close();
                }
                paint_path(
                    ctx,
                    pixmap,
                    state,
                    path,
                    PaintOp::FillStroke(FillRule::EvenOdd),
                );
            }
            "n" => paint_path(ctx, pixmap, state, path, PaintOp::None),
            "BT" => {
                state.text_matrix = Matrix::identity();
                state.text_line_matrix = Matrix::identity();
            }
            "ET" => {}
            "TL" => {
                if let Some(leading) = op_f32(op, 0) {
                    state.text_leading = leading;
                }
            }
            "Tc" => {
                if let Some(spacing) = op_f32(op, 0) {
                    state.char_spacing = spacing;
                }
            }
            "Tw" => {
                if let Some(spacing) = op_f32(op, 0) {
                    state.word_spacing = spacing;
                }
            }
            "Tz" => {
                if let Some(scale_percent) = op_f32(op, 0) {
                    state.text_h_scale = (scale_percent / 100.0).max(0.0);
                }
            }
            "Ts" => {
                if let Some(rise) = op_f32(op, 0) {
                    state.text_rise = rise;
                }
            }
            "Tr" => {
                if let Some(mode) = op_i64(op, 0) {
                    state.text_render_mode = mode.clamp(0, 7);
                }
            }
            "Tf" => {
                if let Some(font_res_name) = op_name(op, 0) {
                    state.font_size = op_f32(op, 1).unwrap_or(12.0).abs();
                    state.font_resource = Some(font_res_name);
                }
            }
            "Td" | "TD" => {
                if let Some([tx, ty]) = op_f32_2(op) {
                    if op.operator == "TD" {
                        state.text_leading = -ty;
                    }
                    let (ux, uy) = text_space_delta_to_user(state.text_line_matrix, tx, ty);
                    state.text_line_matrix =
                        state.text_line_matrix.concat(Matrix::translation(ux, uy));
                    state.text_matrix = state.text_line_matrix;
                }
            }
            "T*" => next_text_line(state),
            "Tm" => {
                if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                    let tm = Matrix::from_operands(a, b, c, d, e, f);
                    state.text_matrix = tm;
                    state.text_line_matrix = tm;
                }
            }
            "Tj" => {
                if let Some(obj) = op.operands.first() {
                    show_text_object(ctx, pixmap, state, resources, obj);
                }
            }
            "'" => {
                next_text_line(state);
                if let Some(obj) = op.operands.first() {
                    show_text_object(ctx, pixmap, state, resources, obj);
                }
            }
            "TJ" => {
                if let Some(arr) = op.operands.first().and_then(|o| o.as_array().ok()) {
                    for item in arr {
                        if item.as_str().is_ok() {
                            show_text_object(ctx, pixmap, state, resources, item);
                        } else if let Some(adj) = obj_to_f32(item) {
                            // Adjustment is thousandths of text-space units.
                            let tx = -(adj / 1000.0) * state.font_size * state.text_h_scale.max(0.0);
                            advance_text_matrix(state, tx);
                        }
                    }
                }
            }
            "Do" => {
                if let Some(name) = op_name(op, 0) {
                    if let Some(obj_id) = resources.xobjects.get(&name).copied() {
                        draw_xobject(ctx, obj_id, resources, pixmap, state, caches)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

enum PaintOp {
    Fill(FillRule),
    Stroke,
    FillStroke(FillRule),
    None,
}

fn paint_path(
    ctx: &RenderContext<'_>,
    pixmap: &mut Pixmap,
    state: &mut GraphicsState,
    path: &mut PathTracker,
    op: PaintOp,
) {
    let pending_clip = path.pending_clip.take();
    let Some(finished) = path.take() else {
        return;
    };
    match op {
        PaintOp::Fill(rule) => {
            let paint = fill_paint(state.fill_color, state.fill_opacity);
            pixmap.fill_path(&finished, &paint, rule, ctx.base, state.clip_mask.as_ref());
        }
        PaintOp::Stroke => {
            let paint = fill_paint(state.stroke_color, state.stroke_opacity);
            let stroke = build_stroke(state);
            pixmap.stroke_path(
                &finished,
                &paint,
                &stroke,
                ctx.base,
                state.clip_mask.as_ref(),
            );
        }
        PaintOp::FillStroke(rule) => {
            let fill = fill_paint(state.fill_color, state.fill_opacity);
            pixmap.fill_path(&finished, &fill, rule, ctx.base, state.clip_mask.as_ref());
            let stroke_paint = fill_paint(state.stroke_color, state.stroke_opacity);
            let stroke = build_stroke(state);
            pixmap.stroke_path(
                &finished,
                &stroke_paint,
                &stroke,
                ctx.base,
                state.clip_mask.as_ref(),
            );
        }
        PaintOp::None => {}
    }
    if let Some(rule) = pending_clip {
        apply_clip_path(state, &finished, rule, ctx.base, ctx.width_px, ctx.height_px);
    }
}

fn apply_clip_path(
    state: &mut GraphicsState,
    path: &Path,
    fill_rule: FillRule,
    transform: Transform,
    width: u32,
    height: u32,
) {
    if let Some(mask) = state.clip_mask.as_mut() {
        mask.intersect_path(path, fill_rule, true, transform);
        return;
    }
    let Some(mut mask) = Mask::new(width, height) else {
        return;
    };
    mask.fill_path(path, fill_rule, true, transform);
    state.clip_mask = Some(mask);
}

fn next_text_line(state: &mut GraphicsState) {
    let (ux, uy) = text_space_delta_to_user(state.text_line_matrix, 0.0, -state.text_leading);
    state.text_line_matrix = state.text_line_matrix.concat(Matrix::translation(ux, uy));
    state.text_matrix = state.text_line_matrix;
}

fn text_space_delta_to_user(m: Matrix, tx: f32, ty: f32) -> (f32, f32) {
    (m.a * tx + m.c * ty, m.b * tx + m.d * ty)
}

fn advance_text_matrix(state: &mut GraphicsState, tx: f32) {
    let (ux, uy) = text_space_delta_to_user(state.text_matrix, tx, 0.0);
    state.text_matrix = state.text_matrix.concat(Matrix::translation(ux, uy));
}

/// Draws one string operand glyph by glyph. Glyph outlines come from
/// the font program embedded in the document; a font without one still
/// advances the text matrix from its width table so the rest of the
/// line lands where it should.
fn show_text_object(
    ctx: &RenderContext<'_>,
    pixmap: &mut Pixmap,
    state: &mut GraphicsState,
    resources: &PageResources,
    obj: &LoObject,
) {
    let Ok(bytes) = obj.as_str() else {
        return;
    };
    let slot = state
        .font_resource
        .as_ref()
        .and_then(|name| resources.fonts.get(name));
    let codes = match slot.map(|s| s.metrics.code_unit) {
        Some(CodeUnit::TwoByteBigEndian) => bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect::<Vec<u16>>(),
        _ => bytes.iter().map(|b| *b as u16).collect(),
    };
    if codes.is_empty() {
        return;
    }

    let invisible = state.text_render_mode == 3 || state.text_render_mode == 7;
    let program = slot.and_then(|s| s.program.as_ref()).cloned();
    let face = program.as_deref().and_then(|data| Face::parse(data, 0).ok());
    let paint = fill_paint(state.fill_color, state.fill_opacity);

    for code in codes {
        if !invisible {
            if let (Some(slot), Some(face)) = (slot, face.as_ref()) {
                draw_glyph(ctx, pixmap, state, slot, face, code, &paint);
            }
        }
        let tx = match slot {
            Some(slot) => {
                let width_units = slot
                    .metrics
                    .widths
                    .get(&code)
                    .copied()
                    .unwrap_or(slot.metrics.default_width)
                    .max(0.0);
                let mut advance = (width_units / 1000.0) * state.font_size + state.char_spacing;
                if code_is_space(slot, code) {
                    advance += state.word_spacing;
                }
                advance
            }
            None => state.font_size.max(0.01) * 0.5 + state.char_spacing,
        };
        advance_text_matrix(state, tx * state.text_h_scale.max(0.0));
    }
}

fn draw_glyph(
    ctx: &RenderContext<'_>,
    pixmap: &mut Pixmap,
    state: &GraphicsState,
    slot: &FontSlot,
    face: &Face<'_>,
    code: u16,
    paint: &Paint<'_>,
) {
    let glyph_id = match slot.metrics.code_unit {
        CodeUnit::SingleByte => {
            let Some(gid) = code_to_char(slot, code).and_then(|ch| face.glyph_index(ch)) else {
                return;
            };
            gid
        }
        // Identity-encoded composite fonts address glyphs by id; the
        // cmap lookup only helps when the subsetter kept one.
        CodeUnit::TwoByteBigEndian => code_to_char(slot, code)
            .and_then(|ch| face.glyph_index(ch))
            .unwrap_or(GlyphId(code)),
    };

    let upem = face.units_per_em().max(1) as f32;
    let glyph_scale = state.font_size / upem;
    let mut builder = GlyphPathBuilder::new(0.0, 0.0, glyph_scale);
    if face.outline_glyph(glyph_id, &mut builder).is_none() {
        return;
    }
    let Some(path) = builder.finish() else {
        return;
    };

    let text_params = Transform::from_row(
        state.text_h_scale.max(0.0),
        0.0,
        0.0,
        1.0,
        0.0,
        state.text_rise,
    );
    let device = ctx
        .base
        .pre_concat(state.ctm.to_transform())
        .pre_concat(state.text_matrix.to_transform())
        .pre_concat(text_params);
    pixmap.fill_path(
        &path,
        paint,
        FillRule::Winding,
        device,
        state.clip_mask.as_ref(),
    );
}

fn code_to_char(slot: &FontSlot, code: u16) -> Option<char> {
    if let Some(mapped) = slot.to_unicode.get(&code) {
        return mapped.chars().next();
    }
    char::from_u32(code as u32)
}

fn code_is_space(slot: &FontSlot, code: u16) -> bool {
    if code == 0x0020 {
        return true;
    }
    slot.to_unicode
        .get(&code)
        .map(|mapped| mapped.as_str() == " ")
        .unwrap_or(false)
}

struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        self.builder.move_to(
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.builder.line_to(
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        self.builder.quad_to(
            self.origin_x + x1 * self.scale,
            self.origin_y + y1 * self.scale,
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.builder.cubic_to(
            self.origin_x + x1 * self.scale,
            self.origin_y + y1 * self.scale,
            self.origin_x + x2 * self.scale,
            self.origin_y + y2 * self.scale,
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn draw_xobject(
    ctx: &RenderContext<'_>,
    obj_id: ObjectId,
    parent_resources: &PageResources,
    pixmap: &mut Pixmap,
    state: &mut GraphicsState,
    caches: &mut RenderCaches,
) -> Result<(), DorureError> {
    let stream = ctx
        .doc
        .get_object(obj_id)
        .map_err(lopdf_err)?
        .as_stream()
        .map_err(lopdf_err)?;
    let subtype = stream
        .dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();

    if subtype == "Form" {
        if !caches.visited_forms.insert(obj_id) {
            return Ok(());
        }
        let form_bytes = stream.get_plain_content().map_err(lopdf_err)?;
        let form_content = Content::decode(&form_bytes).map_err(lopdf_err)?;
        let form_resources = match stream.dict.get(b"Resources") {
            Ok(obj) => resources_from_object(ctx.doc, obj)?,
            Err(_) => PageResources::default(),
        };
        let merged = parent_resources.merged(&form_resources);
        let form_matrix = stream
            .dict
            .get(b"Matrix")
            .ok()
            .and_then(parse_matrix_object)
            .unwrap_or_else(Matrix::identity);

        let mut nested_state = state.clone();
        nested_state.ctm = form_matrix.concat(nested_state.ctm);
        let mut nested_stack = Vec::new();
        let mut nested_path = PathTracker::default();
        render_ops(
            ctx,
            &form_content.operations,
            &merged,
            pixmap,
            &mut nested_state,
            &mut nested_stack,
            &mut nested_path,
            caches,
        )?;
        caches.visited_forms.remove(&obj_id);
        return Ok(());
    }

    if subtype == "Image" {
        let source = caches
            .images
            .entry(obj_id)
            .or_insert_with(|| image_stream_to_pixmap(ctx.doc, stream));
        if let Some(image) = source.as_ref() {
            let src_w = image.width() as f32;
            let src_h = image.height() as f32;
            if src_w > 0.0 && src_h > 0.0 {
                // The image occupies the CTM's unit square; pixel row 0
                // sits at the top of it.
                let local = Transform::from_row(1.0 / src_w, 0.0, 0.0, -1.0 / src_h, 0.0, 1.0);
                let device = ctx
                    .base
                    .pre_concat(state.ctm.to_transform())
                    .pre_concat(local);
                let paint = PixmapPaint {
                    opacity: state.fill_opacity.clamp(0.0, 1.0),
                    quality: FilterQuality::Bilinear,
                    ..PixmapPaint::default()
                };
                pixmap.draw_pixmap(0, 0, image.as_ref(), &paint, device, state.clip_mask.as_ref());
            }
        }
    }

    Ok(())
}

fn parse_matrix_object(obj: &LoObject) -> Option<Matrix> {
    let arr = obj.as_array().ok()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Matrix::from_operands(
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
        obj_to_f32(&arr[4])?,
        obj_to_f32(&arr[5])?,
    ))
}

fn fill_paint(color: Color, opacity: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color, opacity));
    paint.anti_alias = true;
    paint
}

fn to_sk_color(color: Color, opacity: f32) -> tiny_skia::Color {
    let r = color.r.clamp(0.0, 1.0);
    let g = color.g.clamp(0.0, 1.0);
    let b = color.b.clamp(0.0, 1.0);
    let a = opacity.clamp(0.0, 1.0);
    tiny_skia::Color::from_rgba(r, g, b, a)
        .unwrap_or_else(|| tiny_skia::Color::from_rgba8(0, 0, 0, 255))
}

fn build_stroke(state: &GraphicsState) -> Stroke {
    let mut stroke = Stroke::default();
    stroke.width = state.line_width.max(0.0);
    stroke.miter_limit = state.miter_limit.max(0.0);
    stroke.line_cap = match state.line_cap {
        1 => LineCap::Round,
        2 => LineCap::Square,
        _ => LineCap::Butt,
    };
    stroke.line_join = match state.line_join {
        1 => LineJoin::Round,
        2 => LineJoin::Bevel,
        _ => LineJoin::Miter,
    };

    if !state.dash_pattern.is_empty() {
        let mut pattern: Vec<f32> = state.dash_pattern.iter().map(|p| p.max(0.0)).collect();
        if pattern.len() % 2 == 1 {
            let copy = pattern.clone();
            pattern.extend(copy);
        }
        if pattern.len() >= 2 {
            if let Some(dash) = StrokeDash::new(pattern, state.dash_phase) {
                stroke.dash = Some(dash);
            }
        }
    }

    stroke
}

fn resources_from_page(
    doc: &LoDocument,
    page_dict: &LoDictionary,
) -> Result<PageResources, DorureError> {
    match page_dict.get(b"Resources") {
        Ok(obj) => resources_from_object(doc, obj),
        Err(_) => Ok(PageResources::default()),
    }
}

fn resources_from_object(doc: &LoDocument, obj: &LoObject) -> Result<PageResources, DorureError> {
    let resolved = resolve_object(doc, obj)?;
    let dict = match resolved {
        LoObject::Dictionary(d) => d,
        _ => return Ok(PageResources::default()),
    };

    let mut out = PageResources::default();

    if let Ok(font_obj) = dict.get(b"Font") {
        if let Ok(LoObject::Dictionary(font_dict)) = resolve_object(doc, font_obj) {
            for (name, font_ref_obj) in font_dict.iter() {
                out.fonts
                    .insert(name_bytes_to_string(name), font_slot(doc, font_ref_obj));
            }
        }
    }

    if let Ok(xobj_obj) = dict.get(b"XObject") {
        if let Ok(LoObject::Dictionary(xobj_dict)) = resolve_object(doc, xobj_obj) {
            for (name, ref_obj) in xobj_dict.iter() {
                if let Ok(id) = ref_obj.as_reference() {
                    out.xobjects.insert(name_bytes_to_string(name), id);
                }
            }
        }
    }

    if let Ok(gs_obj) = dict.get(b"ExtGState") {
        if let Ok(LoObject::Dictionary(gs_dict)) = resolve_object(doc, gs_obj) {
            for (name, gs_ref_obj) in gs_dict.iter() {
                let Ok(LoObject::Dictionary(gs)) = resolve_object(doc, gs_ref_obj) else {
                    continue;
                };
                let fill = gs
                    .get(b"ca")
                    .ok()
                    .and_then(obj_to_f32)
                    .unwrap_or(1.0)
                    .clamp(0.0, 1.0);
                let stroke = gs
                    .get(b"CA")
                    .ok()
                    .and_then(obj_to_f32)
                    .unwrap_or(1.0)
                    .clamp(0.0, 1.0);
                out.extgstates.insert(name_bytes_to_string(name), (fill, stroke));
            }
        }
    }

    Ok(out)
}

fn font_slot(doc: &LoDocument, obj: &LoObject) -> FontSlot {
    let Ok(LoObject::Dictionary(dict)) = resolve_object(doc, obj) else {
        return FontSlot::default();
    };
    let to_unicode = parse_to_unicode_cmap(doc, dict);
    let program = resolve_embedded_font_bytes(doc, dict).map(Arc::new);
    let metrics = parse_font_metrics(doc, dict, &to_unicode);
    FontSlot {
        to_unicode,
        program,
        metrics,
    }
}

fn parse_font_metrics(
    doc: &LoDocument,
    font_dict: &LoDictionary,
    to_unicode: &HashMap<u16, String>,
) -> FontWidths {
    let subtype = font_dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();
    if subtype == "Type0" {
        return parse_type0_font_metrics(doc, font_dict, to_unicode);
    }
    parse_simple_font_metrics(doc, font_dict)
}

fn parse_type0_font_metrics(
    doc: &LoDocument,
    font_dict: &LoDictionary,
    to_unicode: &HashMap<u16, String>,
) -> FontWidths {
    let encoding_name = font_dict
        .get(b"Encoding")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();
    let code_unit = if encoding_name == "Identity-H"
        || encoding_name == "Identity-V"
        || to_unicode.keys().any(|code| *code > 0x00FF)
    {
        CodeUnit::TwoByteBigEndian
    } else {
        CodeUnit::SingleByte
    };

    let mut default_width = 1000.0f32;
    let mut widths = HashMap::new();

    if let Some(descendant_dict) = font_dict
        .get(b"DescendantFonts")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_array().ok())
        .and_then(|arr| arr.first())
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_dict().ok())
    {
        if let Ok(dw_obj) = descendant_dict.get(b"DW") {
            if let Some(dw) = resolved_obj_to_f32(doc, dw_obj) {
                default_width = dw.max(0.0);
            }
        }
        if let Ok(w_obj) = descendant_dict.get(b"W") {
            widths = parse_cid_font_widths(doc, w_obj);
        }
    }

    FontWidths {
        default_width,
        widths,
        code_unit,
    }
}

fn parse_simple_font_metrics(doc: &LoDocument, font_dict: &LoDictionary) -> FontWidths {
    let mut default_width = 500.0f32;
    if let Ok(descriptor_obj) = font_dict.get(b"FontDescriptor") {
        if let Some(descriptor_dict) = resolve_object(doc, descriptor_obj)
            .ok()
            .and_then(|obj| obj.as_dict().ok())
        {
            if let Ok(missing_obj) = descriptor_dict.get(b"MissingWidth") {
                if let Some(missing) = resolved_obj_to_f32(doc, missing_obj) {
                    default_width = missing.max(0.0);
                }
            }
        }
    }

    let first_char = font_dict
        .get(b"FirstChar")
        .ok()
        .and_then(|obj| resolved_obj_to_u16(doc, obj))
        .unwrap_or(0u16);
    let mut widths = HashMap::new();
    if let Ok(widths_obj) = font_dict.get(b"Widths") {
        if let Some(width_arr) = resolve_object(doc, widths_obj)
            .ok()
            .and_then(|obj| obj.as_array().ok())
        {
            for (idx, width_obj) in width_arr.iter().enumerate() {
                let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
                    continue;
                };
                let Ok(offset) = u16::try_from(idx) else {
                    break;
                };
                let Some(code) = first_char.checked_add(offset) else {
                    break;
                };
                widths.insert(code, width.max(0.0));
            }
        }
    }

    FontWidths {
        default_width,
        widths,
        code_unit: CodeUnit::SingleByte,
    }
}

fn parse_cid_font_widths(doc: &LoDocument, obj: &LoObject) -> HashMap<u16, f32> {
    let mut out = HashMap::new();
    let Some(width_items) = resolve_object(doc, obj)
        .ok()
        .and_then(|resolved| resolved.as_array().ok())
    else {
        return out;
    };

    let mut idx = 0usize;
    while idx < width_items.len() {
        let Some(start_cid) = resolved_obj_to_u16(doc, &width_items[idx]) else {
            idx += 1;
            continue;
        };
        if idx + 1 >= width_items.len() {
            break;
        }

        let next_obj = match resolve_object(doc, &width_items[idx + 1]) {
            Ok(obj) => obj,
            Err(_) => {
                idx += 1;
                continue;
            }
        };

        // Either `start [w w w ...]` or `start end w`.
        if let Ok(width_list) = next_obj.as_array() {
            for (offset, width_obj) in width_list.iter().enumerate() {
                let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
                    continue;
                };
                let Ok(step) = u16::try_from(offset) else {
                    break;
                };
                let Some(code) = start_cid.checked_add(step) else {
                    break;
                };
                out.insert(code, width.max(0.0));
            }
            idx += 2;
            continue;
        }

        let Some(end_cid) = resolved_obj_to_u16(doc, &width_items[idx + 1]) else {
            idx += 1;
            continue;
        };
        let Some(width_obj) = width_items.get(idx + 2) else {
            break;
        };
        let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
            idx += 3;
            continue;
        };

        for code in start_cid..=end_cid {
            out.insert(code, width.max(0.0));
            if code == u16::MAX {
                break;
            }
        }
        idx += 3;
    }

    out
}

fn resolved_obj_to_f32(doc: &LoDocument, obj: &LoObject) -> Option<f32> {
    let resolved = resolve_object(doc, obj).ok()?;
    obj_to_f32(resolved)
}

fn resolved_obj_to_u16(doc: &LoDocument, obj: &LoObject) -> Option<u16> {
    let resolved = resolve_object(doc, obj).ok()?;
    if let Ok(v) = resolved.as_i64() {
        return u16::try_from(v).ok();
    }
    let v = obj_to_f32(resolved)?;
    if !(0.0..=(u16::MAX as f32)).contains(&v) {
        return None;
    }
    Some(v.round() as u16)
}

fn resolve_embedded_font_bytes(doc: &LoDocument, font_dict: &LoDictionary) -> Option<Vec<u8>> {
    let subtype = font_dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();

    if subtype == "Type0" {
        let descendants = font_dict.get(b"DescendantFonts").ok()?.as_array().ok()?;
        let descendant = descendants.first()?;
        let descendant_dict = resolve_object(doc, descendant).ok()?.as_dict().ok()?;
        let descriptor_obj = descendant_dict.get(b"FontDescriptor").ok()?;
        return font_descriptor_file_bytes(doc, descriptor_obj);
    }

    let descriptor_obj = font_dict.get(b"FontDescriptor").ok()?;
    font_descriptor_file_bytes(doc, descriptor_obj)
}

fn font_descriptor_file_bytes(doc: &LoDocument, descriptor_obj: &LoObject) -> Option<Vec<u8>> {
    let descriptor = resolve_object(doc, descriptor_obj).ok()?.as_dict().ok()?;
    for key in [
        b"FontFile2".as_slice(),
        b"FontFile3".as_slice(),
        b"FontFile".as_slice(),
    ] {
        if let Ok(obj) = descriptor.get(key) {
            if let Some(data) = resolve_object(doc, obj)
                .ok()
                .and_then(|o| o.as_stream().ok())
                .and_then(|s| s.get_plain_content().ok())
            {
                if !data.is_empty() {
                    return Some(data);
                }
            }
        }
    }
    None
}

fn parse_to_unicode_cmap(doc: &LoDocument, font_dict: &LoDictionary) -> HashMap<u16, String> {
    let mut map = HashMap::new();
    let to_unicode_obj = match font_dict.get(b"ToUnicode") {
        Ok(obj) => obj,
        Err(_) => return map,
    };
    let stream = match resolve_object(doc, to_unicode_obj)
        .ok()
        .and_then(|obj| obj.as_stream().ok())
    {
        Some(s) => s,
        None => return map,
    };
    let bytes = match stream.get_plain_content() {
        Ok(data) => data,
        Err(_) => return map,
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut in_bfchar = false;
    let mut in_bfrange = false;
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.ends_with("beginbfchar") {
            in_bfchar = true;
            in_bfrange = false;
            continue;
        }
        if line.ends_with("endbfchar") {
            in_bfchar = false;
            continue;
        }
        if line.ends_with("beginbfrange") {
            in_bfrange = true;
            in_bfchar = false;
            continue;
        }
        if line.ends_with("endbfrange") {
            in_bfrange = false;
            continue;
        }
        if in_bfchar {
            let tokens = extract_hex_tokens(line);
            if tokens.len() >= 2 {
                if let Some(src) = hex_bytes_to_u16(&tokens[0]) {
                    let dst = hex_bytes_to_unicode(&tokens[1]);
                    map.insert(src, dst);
                }
            }
            continue;
        }
        if in_bfrange {
            let tokens = extract_hex_tokens(line);
            if tokens.len() < 3 {
                continue;
            }
            let start = match hex_bytes_to_u16(&tokens[0]) {
                Some(v) => v,
                None => continue,
            };
            let end = match hex_bytes_to_u16(&tokens[1]) {
                Some(v) => v,
                None => continue,
            };
            if start > end {
                continue;
            }
            if line.contains('[') {
                for (idx, token) in tokens.iter().skip(2).enumerate() {
                    let code = start.saturating_add(idx as u16);
                    if code > end {
                        break;
                    }
                    map.insert(code, hex_bytes_to_unicode(token));
                }
            } else if let Some(base) = hex_bytes_to_u16(&tokens[2]) {
                for code in start..=end {
                    let dst = base.saturating_add(code.saturating_sub(start));
                    if let Some(ch) = char::from_u32(dst as u32) {
                        map.insert(code, ch.to_string());
                    }
                }
            }
        }
    }
    map
}

fn extract_hex_tokens(line: &str) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != b'>' {
                i += 1;
            }
            let token = &line[start..i];
            if let Some(decoded) = parse_hex(token) {
                out.push(decoded);
            }
        }
        i += 1;
    }
    out
}

fn parse_hex(token: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut nibbles = Vec::new();
    for ch in token.chars() {
        if ch.is_whitespace() {
            continue;
        }
        let val = ch.to_digit(16)? as u8;
        nibbles.push(val);
    }
    if nibbles.is_empty() {
        return Some(bytes);
    }
    if nibbles.len() % 2 != 0 {
        nibbles.push(0);
    }
    for pair in nibbles.chunks_exact(2) {
        bytes.push((pair[0] << 4) | pair[1]);
    }
    Some(bytes)
}

fn hex_bytes_to_u16(bytes: &[u8]) -> Option<u16> {
    if bytes.len() == 2 {
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

fn hex_bytes_to_unicode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    if bytes.len() % 2 == 0 {
        let mut units = Vec::with_capacity(bytes.len() / 2);
        for chunk in bytes.chunks_exact(2) {
            units.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).to_string()
}

fn image_stream_to_pixmap(doc: &LoDocument, stream: &lopdf::Stream) -> Option<Pixmap> {
    let filters = stream.filters().unwrap_or_default();
    let has_dct = filters.iter().any(|f| *f == b"DCTDecode");
    if has_dct {
        return decoded_image_to_pixmap(&stream.content);
    }

    if filters.is_empty() {
        if image::guess_format(&stream.content).is_ok() {
            return decoded_image_to_pixmap(&stream.content);
        }
    }

    let plain = stream.get_plain_content().ok()?;
    if let Some(pixmap) = raw_samples_to_pixmap(doc, stream, &plain) {
        return Some(pixmap);
    }
    decoded_image_to_pixmap(&plain)
}

fn decoded_image_to_pixmap(data: &[u8]) -> Option<Pixmap> {
    let decoded = image::load_from_memory(data).ok()?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)?;
    let src = rgba.as_raw();
    let dst = pixmap.data_mut();
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

#[derive(Clone, Copy)]
enum DirectColor {
    Gray,
    Rgb,
    Cmyk,
}

impl DirectColor {
    fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }

    fn rgb_from_bytes(self, bytes: &[u8]) -> Option<(u8, u8, u8)> {
        match self {
            Self::Gray => {
                let v = *bytes.first()?;
                Some((v, v, v))
            }
            Self::Rgb => Some((*bytes.first()?, *bytes.get(1)?, *bytes.get(2)?)),
            Self::Cmyk => {
                let c = (*bytes.first()? as f32) / 255.0;
                let m = (*bytes.get(1)? as f32) / 255.0;
                let y = (*bytes.get(2)? as f32) / 255.0;
                let k = (*bytes.get(3)? as f32) / 255.0;
                let (rf, gf, bf) = cmyk_to_rgb(c, m, y, k);
                Some((
                    (rf.clamp(0.0, 1.0) * 255.0) as u8,
                    (gf.clamp(0.0, 1.0) * 255.0) as u8,
                    (bf.clamp(0.0, 1.0) * 255.0) as u8,
                ))
            }
        }
    }
}

enum SampleColorSpace {
    Direct(DirectColor),
    Indexed { base: DirectColor, lookup: Vec<u8> },
}

fn direct_color_from_name(name: &[u8]) -> Option<DirectColor> {
    match name {
        b"DeviceGray" => Some(DirectColor::Gray),
        b"DeviceRGB" => Some(DirectColor::Rgb),
        b"DeviceCMYK" => Some(DirectColor::Cmyk),
        _ => None,
    }
}

fn parse_sample_color_space(doc: &LoDocument, obj: &LoObject) -> Option<SampleColorSpace> {
    let resolved = resolve_object(doc, obj).ok()?;
    match resolved {
        LoObject::Name(name) => {
            let direct = direct_color_from_name(name.as_slice())?;
            Some(SampleColorSpace::Direct(direct))
        }
        LoObject::Array(arr) => parse_sample_color_space_array(doc, arr),
        _ => None,
    }
}

fn parse_sample_color_space_array(doc: &LoDocument, arr: &[LoObject]) -> Option<SampleColorSpace> {
    let head = arr.first()?;
    let head_name = resolve_object(doc, head).ok()?.as_name().ok()?;

    if let Some(direct) = direct_color_from_name(head_name) {
        return Some(SampleColorSpace::Direct(direct));
    }
    if head_name != b"Indexed" || arr.len() < 4 {
        return None;
    }

    let base = match parse_sample_color_space(doc, arr.get(1)?)? {
        SampleColorSpace::Direct(mode) => mode,
        SampleColorSpace::Indexed { .. } => return None,
    };
    let lookup = lookup_table_bytes(doc, arr.get(3)?)?;
    Some(SampleColorSpace::Indexed { base, lookup })
}

fn lookup_table_bytes(doc: &LoDocument, obj: &LoObject) -> Option<Vec<u8>> {
    let resolved = resolve_object(doc, obj).ok()?;
    match resolved {
        LoObject::String(bytes, _) => Some(bytes.clone()),
        LoObject::Stream(stream) => stream.get_plain_content().ok(),
        _ => None,
    }
}

fn raw_samples_to_pixmap(
    doc: &LoDocument,
    stream: &lopdf::Stream,
    plain: &[u8],
) -> Option<Pixmap> {
    let width = stream
        .dict
        .get(b"Width")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())?;
    let height = stream
        .dict
        .get(b"Height")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())?;
    let bpc = stream
        .dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(obj_to_f32)
        .unwrap_or(8.0);
    if (bpc - 8.0).abs() > 0.01 {
        return None;
    }

    let color_space = match stream.dict.get(b"ColorSpace") {
        Ok(obj) => parse_sample_color_space(doc, obj)?,
        Err(_) => SampleColorSpace::Direct(DirectColor::Gray),
    };
    let pixels = (width as usize).saturating_mul(height as usize);
    let expected = match &color_space {
        SampleColorSpace::Direct(mode) => pixels.saturating_mul(mode.channels()),
        SampleColorSpace::Indexed { .. } => pixels,
    };
    if plain.len() < expected {
        return None;
    }

    let mut pixmap = Pixmap::new(width, height)?;
    let data = pixmap.data_mut();
    let mut src = 0usize;
    let mut dst = 0usize;
    while dst + 4 <= data.len() {
        let (r, g, b) = match &color_space {
            SampleColorSpace::Direct(mode) => {
                let channels = mode.channels();
                if src + channels > plain.len() {
                    return None;
                }
                let rgb = mode.rgb_from_bytes(&plain[src..(src + channels)])?;
                src += channels;
                rgb
            }
            SampleColorSpace::Indexed { base, lookup } => {
                let idx = *plain.get(src)? as usize;
                src += 1;
                let channels = base.channels();
                let offset = idx.saturating_mul(channels);
                if offset + channels > lookup.len() {
                    return None;
                }
                base.rgb_from_bytes(&lookup[offset..(offset + channels)])?
            }
        };
        data[dst] = r;
        data[dst + 1] = g;
        data[dst + 2] = b;
        data[dst + 3] = 255;
        dst += 4;
    }

    Some(pixmap)
}

fn cmyk_to_rgb(c: f32, m: f32, y: f32, k: f32) -> (f32, f32, f32) {
    let c = c.clamp(0.0, 1.0);
    let m = m.clamp(0.0, 1.0);
    let y = y.clamp(0.0, 1.0);
    let k = k.clamp(0.0, 1.0);
    let r = (1.0 - c) * (1.0 - k);
    let g = (1.0 - m) * (1.0 - k);
    let b = (1.0 - y) * (1.0 - k);
    (r, g, b)
}

fn op_name(op: &Operation, idx: usize) -> Option<String> {
    let obj = op.operands.get(idx)?;
    let name = obj.as_name().ok()?;
    Some(name_bytes_to_string(name))
}

fn op_f32(op: &Operation, idx: usize) -> Option<f32> {
    obj_to_f32(op.operands.get(idx)?)
}

fn op_i64(op: &Operation, idx: usize) -> Option<i64> {
    op.operands.get(idx)?.as_i64().ok()
}

fn op_f32_2(op: &Operation) -> Option<[f32; 2]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?])
}

fn op_f32_3(op: &Operation) -> Option<[f32; 3]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?, op_f32(op, 2)?])
}

fn op_f32_4(op: &Operation) -> Option<[f32; 4]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
    ])
}

fn op_f32_6(op: &Operation) -> Option<[f32; 6]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
        op_f32(op, 4)?,
        op_f32(op, 5)?,
    ])
}

fn name_bytes_to_string(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pt;
    use lopdf::{Stream as LoStream, dictionary};

    fn letter_pages_pdf(contents: &[&str]) -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<LoObject> = Vec::new();
        for content in contents {
            let content_id =
                doc.add_object(LoStream::new(dictionary! {}, content.as_bytes().to_vec()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
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

    fn decode_png(bytes: &[u8]) -> image::RgbaImage {
        image::load_from_memory(bytes).unwrap().to_rgba8()
    }

    fn is_dark(px: &image::Rgba<u8>) -> bool {
        px.0[0] < 64 && px.0[1] < 64 && px.0[2] < 64
    }

    fn is_white(px: &image::Rgba<u8>) -> bool {
        px.0[0] == 255 && px.0[1] == 255 && px.0[2] == 255
    }

    #[test]
    fn page_count_and_pixel_dimensions() {
        let bytes = letter_pages_pdf(&["q Q", "q Q"]);
        let raster = PageRasterizer::open(&bytes).unwrap();
        assert_eq!(raster.page_count(), 2);
        assert_eq!(raster.page_size(0).unwrap().width, Pt::from_i32(612));

        let bitmap = raster.render_page(0, 1.0).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (612, 792));

        // 150 DPI equivalent.
        let bitmap = raster.render_page(1, 150.0 / 72.0).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (1275, 1650));
    }

    #[test]
    fn filled_rect_lands_at_device_coordinates() {
        // 200x50pt rect with its bottom-left at (100, 600).
        let bytes = letter_pages_pdf(&["0 0 0 rg 100 600 200 50 re f"]);
        let raster = PageRasterizer::open(&bytes).unwrap();
        let png = raster
            .render_page(0, 1.0)
            .unwrap()
            .encode(BitmapFormat::Png, 1.0)
            .unwrap();
        let img = decode_png(&png);
        // PDF y 600..650 maps to device rows 142..192.
        assert!(is_dark(img.get_pixel(200, 165)));
        assert!(is_white(img.get_pixel(50, 165)));
        assert!(is_white(img.get_pixel(200, 400)));
    }

    #[test]
    fn cm_scales_apply_to_later_coordinates() {
        let bytes = letter_pages_pdf(&["q 2 0 0 2 0 0 cm 0 0 0 rg 50 50 50 50 re f Q"]);
        let raster = PageRasterizer::open(&bytes).unwrap();
        let png = raster
            .render_page(0, 1.0)
            .unwrap()
            .encode(BitmapFormat::Png, 1.0)
            .unwrap();
        let img = decode_png(&png);
        // Scaled rect covers PDF 100..200 on both axes.
        assert!(is_dark(img.get_pixel(150, 792 - 150)));
        assert!(is_white(img.get_pixel(75, 792 - 75)));
    }

    #[test]
    fn clip_path_limits_painting() {
        let content = "q 0 0 100 100 re W n 0 0 0 rg 0 0 612 792 re f Q";
        let bytes = letter_pages_pdf(&[content]);
        let raster = PageRasterizer::open(&bytes).unwrap();
        let png = raster
            .render_page(0, 1.0)
            .unwrap()
            .encode(BitmapFormat::Png, 1.0)
            .unwrap();
        let img = decode_png(&png);
        // Only the bottom-left 100x100pt square may carry ink.
        assert!(is_dark(img.get_pixel(50, 792 - 50)));
        assert!(is_white(img.get_pixel(300, 300)));
        assert!(is_white(img.get_pixel(150, 792 - 50)));
    }

    #[test]
    fn jpeg_encode_keeps_dimensions_and_flattens_to_white() {
        let bytes = letter_pages_pdf(&["q Q"]);
        let raster = PageRasterizer::open(&bytes).unwrap();
        let jpeg = raster
            .render_page(0, 0.5)
            .unwrap()
            .encode(BitmapFormat::Jpeg, 0.8)
            .unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
        let img = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (306, 396));
        // Blank page comes back white, not black.
        assert!(img.get_pixel(100, 100).0.iter().all(|c| *c > 240));
    }

    #[test]
    fn page_index_and_scale_are_validated() {
        let bytes = letter_pages_pdf(&["q Q"]);
        let raster = PageRasterizer::open(&bytes).unwrap();
        match raster.render_page(3, 1.0) {
            Err(DorureError::PageIndexOutOfRange { index, page_count }) => {
                assert_eq!((index, page_count), (3, 1));
            }
            other => panic!("expected page index error, got {other:?}"),
        }
        assert!(matches!(
            raster.render_page(0, 0.0),
            Err(DorureError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn format_names_parse_or_reject() {
        assert_eq!(BitmapFormat::from_name("jpg").unwrap(), BitmapFormat::Jpeg);
        assert_eq!(BitmapFormat::from_name("JPEG").unwrap(), BitmapFormat::Jpeg);
        assert_eq!(BitmapFormat::from_name(".png").unwrap(), BitmapFormat::Png);
        let err = BitmapFormat::from_name("webp").unwrap_err();
        assert!(err.to_string().contains("unsupported format"));
        assert_eq!(BitmapFormat::Jpeg.extension(), "jpg");
        assert_eq!(BitmapFormat::Png.mime_type(), "image/png");
    }
}
