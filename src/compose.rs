use std::collections::{HashMap, HashSet};

use lopdf::content::{Content, Operation};
use lopdf::{
    Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId,
    Stream as LoStream, StringFormat, dictionary,
};

use crate::coords;
use crate::debug::DebugLogger;
use crate::docmodel::{
    choice_options, inherited_name, inherited_object, lopdf_err, page_size_for_id, resolve_object,
    terminal_field_ids,
};
use crate::error::DorureError;
use crate::image_data::{EmbeddableImage, image_from_bytes, parse_data_uri};
use crate::placement::{PlacedContent, PlacedItem};
use crate::types::{Color, Pt, Size};

const TIMESTAMP_SIZE_FACTOR: f32 = 0.055;
const TIMESTAMP_SIZE_MIN_PT: f32 = 7.0;
const TIMESTAMP_SIZE_MAX_PT: f32 = 12.0;
const TIMESTAMP_GAP_PT: f32 = 3.0;
const TIMESTAMP_GRAY: f32 = 0.35;

/// Resource names we add to pages. The `Ov` prefix keeps them clear of
/// conventional names like `/Helv` that source documents already use.
pub(crate) const OVERLAY_FONT_RES: &str = "OvHelv";
const OVERLAY_IMAGE_PREFIX: &str = "OvIm";

/// One requested form-field change, matched to a field by its fully
/// qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEdit {
    pub field_name: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Checkbox(bool),
    Dropdown(String),
}

impl FieldEdit {
    pub fn text(field_name: &str, value: &str) -> FieldEdit {
        FieldEdit {
            field_name: field_name.to_string(),
            value: FieldValue::Text(value.to_string()),
        }
    }

    pub fn checkbox(field_name: &str, checked: bool) -> FieldEdit {
        FieldEdit {
            field_name: field_name.to_string(),
            value: FieldValue::Checkbox(checked),
        }
    }

    pub fn dropdown(field_name: &str, option: &str) -> FieldEdit {
        FieldEdit {
            field_name: field_name.to_string(),
            value: FieldValue::Dropdown(option.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeOptions {
    pub flatten_form: bool,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        ComposeOptions { flatten_form: true }
    }
}

/// Applies field edits and placed overlays to a fresh parse of
/// `source`, then serializes the result.
///
/// Field edits are best-effort: a missing field name, a kind mismatch
/// or an unknown dropdown option skips that one edit with a warning.
/// Placed-item failures (bad image bytes, page index out of range) are
/// fatal for the whole export. Flattening failures downgrade to a
/// warning and the interactive form is kept.
pub fn compose(
    source: &[u8],
    field_edits: &[FieldEdit],
    placed_items: &[PlacedItem],
    options: &ComposeOptions,
    debug: Option<&DebugLogger>,
) -> Result<Vec<u8>, DorureError> {
    let mut composer = Composer::open(source)?;
    let applied = composer.apply_field_edits(field_edits, debug);
    composer.draw_placed_items(placed_items)?;
    if options.flatten_form {
        if let Err(err) = crate::flatten::flatten_form(&mut composer.doc) {
            if let Some(debug) = debug {
                debug.warn("flatten_skipped", &err.to_string());
            }
        }
    } else if applied > 0 {
        // Leave appearance regeneration to the viewer.
        composer.set_need_appearances();
    }
    composer.finish()
}

enum EditOutcome {
    Applied,
    Skipped(&'static str),
}

struct Composer {
    doc: LoDocument,
    pages: Vec<(ObjectId, Size)>,
    overlay_font_id: Option<ObjectId>,
    wrapped_pages: HashSet<ObjectId>,
    image_seq: usize,
}

impl Composer {
    fn open(source: &[u8]) -> Result<Composer, DorureError> {
        let doc = LoDocument::load_mem(source).map_err(lopdf_err)?;
        let page_map = doc.get_pages();
        if page_map.is_empty() {
            return Err(DorureError::MalformedDocument(
                "page tree resolves to zero pages".to_string(),
            ));
        }
        let mut pages = Vec::with_capacity(page_map.len());
        for (_page_no, page_id) in page_map {
            let size = page_size_for_id(&doc, page_id)?;
            pages.push((page_id, size));
        }
        Ok(Composer {
            doc,
            pages,
            overlay_font_id: None,
            wrapped_pages: HashSet::new(),
            image_seq: 0,
        })
    }

    fn apply_field_edits(&mut self, edits: &[FieldEdit], debug: Option<&DebugLogger>) -> usize {
        if edits.is_empty() {
            return 0;
        }
        let by_name: HashMap<String, ObjectId> = terminal_field_ids(&self.doc)
            .into_iter()
            .map(|(id, name)| (name, id))
            .collect();
        let mut applied = 0usize;
        for edit in edits {
            let Some(&field_id) = by_name.get(&edit.field_name) else {
                warn_edit(
                    debug,
                    &DorureError::FieldNotFound(edit.field_name.clone()).to_string(),
                );
                continue;
            };
            match self.apply_one_edit(field_id, &edit.value) {
                Ok(EditOutcome::Applied) => applied += 1,
                Ok(EditOutcome::Skipped(reason)) => {
                    warn_edit(debug, &format!("{}: {reason}", edit.field_name));
                }
                Err(err) => {
                    warn_edit(debug, &format!("{}: {err}", edit.field_name));
                }
            }
        }
        applied
    }

    fn apply_one_edit(
        &mut self,
        field_id: ObjectId,
        value: &FieldValue,
    ) -> Result<EditOutcome, DorureError> {
        let field_type = {
            let dict = self.field_dict(field_id)?;
            inherited_name(&self.doc, dict, b"FT").unwrap_or_default()
        };
        match (field_type.as_slice(), value) {
            (b"Tx", FieldValue::Text(text)) => {
                self.set_field_value(field_id, pdf_text_string(text))?;
                self.remove_stale_appearances(field_id);
                Ok(EditOutcome::Applied)
            }
            (b"Btn", FieldValue::Checkbox(checked)) => {
                let state = if *checked {
                    self.checkbox_on_state(field_id)?
                } else {
                    b"Off".to_vec()
                };
                self.set_field_value(field_id, LoObject::Name(state.clone()))?;
                self.set_widget_states(field_id, state);
                Ok(EditOutcome::Applied)
            }
            (b"Ch", FieldValue::Dropdown(option)) => {
                let options = {
                    let dict = self.field_dict(field_id)?;
                    choice_options(&self.doc, dict)
                };
                if !options.iter().any(|candidate| candidate == option) {
                    return Ok(EditOutcome::Skipped("option not offered by the field"));
                }
                self.set_field_value(field_id, pdf_text_string(option))?;
                self.remove_stale_appearances(field_id);
                Ok(EditOutcome::Applied)
            }
            _ => Ok(EditOutcome::Skipped("value kind does not match field type")),
        }
    }

    fn field_dict(&self, field_id: ObjectId) -> Result<&LoDictionary, DorureError> {
        self.doc
            .get_object(field_id)
            .map_err(lopdf_err)?
            .as_dict()
            .map_err(lopdf_err)
    }

    fn set_field_value(
        &mut self,
        field_id: ObjectId,
        value: LoObject,
    ) -> Result<(), DorureError> {
        let dict = self
            .doc
            .get_object_mut(field_id)
            .map_err(lopdf_err)?
            .as_dict_mut()
            .map_err(lopdf_err)?;
        dict.set("V", value);
        Ok(())
    }

    /// Checkbox "on" is whatever non-Off appearance state the widget
    /// declares; `Yes` is the fallback the format suggests.
    fn checkbox_on_state(&self, field_id: ObjectId) -> Result<Vec<u8>, DorureError> {
        for id in self.field_and_kid_ids(field_id) {
            let Some(dict) = self
                .doc
                .get_object(id)
                .ok()
                .and_then(|obj| obj.as_dict().ok())
            else {
                continue;
            };
            if let Some(state) = appearance_on_state(&self.doc, dict) {
                return Ok(state);
            }
        }
        Ok(b"Yes".to_vec())
    }

    fn field_and_kid_ids(&self, field_id: ObjectId) -> Vec<ObjectId> {
        let mut ids = vec![field_id];
        if let Some(dict) = self
            .doc
            .get_object(field_id)
            .ok()
            .and_then(|obj| obj.as_dict().ok())
        {
            if let Ok(kids) = dict.get(b"Kids").and_then(LoObject::as_array) {
                for kid in kids {
                    if let Ok(kid_id) = kid.as_reference() {
                        ids.push(kid_id);
                    }
                }
            }
        }
        ids
    }

    fn set_widget_states(&mut self, field_id: ObjectId, state: Vec<u8>) {
        for id in self.field_and_kid_ids(field_id) {
            if let Ok(dict) = self
                .doc
                .get_object_mut(id)
                .and_then(LoObject::as_dict_mut)
            {
                dict.set("AS", LoObject::Name(state.clone()));
            }
        }
    }

    /// Old appearance streams would keep showing the previous value.
    fn remove_stale_appearances(&mut self, field_id: ObjectId) {
        for id in self.field_and_kid_ids(field_id) {
            if let Ok(dict) = self
                .doc
                .get_object_mut(id)
                .and_then(LoObject::as_dict_mut)
            {
                dict.remove(b"AP");
            }
        }
    }

    fn set_need_appearances(&mut self) {
        let Some(root_id) = self
            .doc
            .trailer
            .get(b"Root")
            .ok()
            .and_then(|obj| obj.as_reference().ok())
        else {
            return;
        };
        let acroform_ref = {
            let Ok(catalog) = self
                .doc
                .get_object(root_id)
                .and_then(LoObject::as_dict)
            else {
                return;
            };
            match catalog.get(b"AcroForm") {
                Ok(LoObject::Reference(rid)) => Some(*rid),
                Ok(LoObject::Dictionary(_)) => None,
                _ => return,
            }
        };
        match acroform_ref {
            Some(rid) => {
                if let Ok(dict) = self
                    .doc
                    .get_object_mut(rid)
                    .and_then(LoObject::as_dict_mut)
                {
                    dict.set("NeedAppearances", true);
                }
            }
            None => {
                if let Ok(catalog) = self
                    .doc
                    .get_object_mut(root_id)
                    .and_then(LoObject::as_dict_mut)
                {
                    if let Ok(LoObject::Dictionary(acroform)) = catalog.get_mut(b"AcroForm") {
                        acroform.set("NeedAppearances", true);
                    }
                }
            }
        }
    }

    fn draw_placed_items(&mut self, items: &[PlacedItem]) -> Result<(), DorureError> {
        for item in items {
            let (page_id, page_size) = self.page_for_index(item.page_index)?;
            match &item.content {
                PlacedContent::Image(bytes) => {
                    self.draw_image_item(page_id, page_size, item, bytes)?;
                }
                PlacedContent::Text(text) => {
                    self.draw_text_item(page_id, page_size, item, text)?;
                }
            }
        }
        Ok(())
    }

    fn page_for_index(&self, index: usize) -> Result<(ObjectId, Size), DorureError> {
        self.pages
            .get(index)
            .copied()
            .ok_or(DorureError::PageIndexOutOfRange {
                index,
                page_count: self.pages.len(),
            })
    }

    fn draw_image_item(
        &mut self,
        page_id: ObjectId,
        page_size: Size,
        item: &PlacedItem,
        raw: &[u8],
    ) -> Result<(), DorureError> {
        let image = decode_item_image(raw)?;
        let aspect = image.height as f32 / image.width.max(1) as f32;
        let width_pt = item.width_percent * page_size.width.to_f32();
        let height_pt = width_pt * aspect;
        let (x, y) = coords::to_pdf_space(
            item.x_percent,
            item.y_percent,
            page_size,
            Pt::from_f32(height_pt),
        );
        let (x, y) = (x.to_f32(), y.to_f32());

        let res_name = self.register_image(page_id, image)?;
        self.append_overlay(
            page_id,
            vec![
                op("q", vec![]),
                op(
                    "cm",
                    vec![
                        real(width_pt),
                        real(0.0),
                        real(0.0),
                        real(height_pt),
                        real(x),
                        real(y),
                    ],
                ),
                op("Do", vec![LoObject::Name(res_name.into_bytes())]),
                op("Q", vec![]),
            ],
        )?;

        if let Some(label) = item.timestamp_label.as_deref() {
            let size = (width_pt * TIMESTAMP_SIZE_FACTOR)
                .clamp(TIMESTAMP_SIZE_MIN_PT, TIMESTAMP_SIZE_MAX_PT);
            let gray = Color::rgb(TIMESTAMP_GRAY, TIMESTAMP_GRAY, TIMESTAMP_GRAY);
            ensure_overlay_font(&mut self.doc, &mut self.overlay_font_id, page_id)?;
            self.append_overlay(
                page_id,
                text_show_ops(size, gray, x, y - size - TIMESTAMP_GAP_PT, label),
            )?;
        }
        Ok(())
    }

    fn draw_text_item(
        &mut self,
        page_id: ObjectId,
        page_size: Size,
        item: &PlacedItem,
        text: &str,
    ) -> Result<(), DorureError> {
        let size = item.font_size_pt;
        let (x, y) = coords::to_pdf_space(
            item.x_percent,
            item.y_percent,
            page_size,
            Pt::from_f32(size),
        );
        ensure_overlay_font(&mut self.doc, &mut self.overlay_font_id, page_id)?;
        self.append_overlay(
            page_id,
            text_show_ops(size, item.color, x.to_f32(), y.to_f32(), text),
        )
    }

    fn register_image(
        &mut self,
        page_id: ObjectId,
        image: EmbeddableImage,
    ) -> Result<String, DorureError> {
        let stream_id = add_image_xobject(&mut self.doc, image);
        let res_name = format!("{OVERLAY_IMAGE_PREFIX}{}", self.image_seq);
        self.image_seq += 1;
        upsert_page_resource(
            &mut self.doc,
            page_id,
            b"XObject",
            &res_name,
            stream_id.into(),
        )?;
        Ok(res_name)
    }

    /// First touch of a page wraps its original content in q/Q so a
    /// dangling transform in the source cannot shift our overlays.
    fn append_overlay(
        &mut self,
        page_id: ObjectId,
        ops: Vec<Operation>,
    ) -> Result<(), DorureError> {
        if self.wrapped_pages.insert(page_id) {
            wrap_page_content(&mut self.doc, page_id)?;
        }
        append_page_content(&mut self.doc, page_id, ops)
    }

    fn finish(mut self) -> Result<Vec<u8>, DorureError> {
        self.doc.prune_objects();
        self.doc.renumber_objects();
        self.doc.compress();
        let mut out = Vec::new();
        self.doc.save_to(&mut out)?;
        Ok(out)
    }
}

fn warn_edit(debug: Option<&DebugLogger>, detail: &str) {
    if let Some(debug) = debug {
        debug.warn("field_edit_skipped", detail);
    }
}

fn appearance_on_state(doc: &LoDocument, dict: &LoDictionary) -> Option<Vec<u8>> {
    let ap = dict.get(b"AP").ok()?;
    let ap = resolve_object(doc, ap).ok()?.as_dict().ok()?;
    let normal = ap.get(b"N").ok()?;
    let normal = resolve_object(doc, normal).ok()?.as_dict().ok()?;
    for (key, _value) in normal.iter() {
        if key.as_slice() != b"Off" {
            return Some(key.clone());
        }
    }
    None
}

fn decode_item_image(raw: &[u8]) -> Result<EmbeddableImage, DorureError> {
    if raw.starts_with(b"data:") {
        let uri = std::str::from_utf8(raw).map_err(|_| {
            DorureError::UnsupportedFormat("data URI is not valid UTF-8".to_string())
        })?;
        let Some((mime, bytes)) = parse_data_uri(uri) else {
            return Err(DorureError::UnsupportedFormat(
                "malformed data URI".to_string(),
            ));
        };
        return image_from_bytes(&bytes, Some(&mime));
    }
    image_from_bytes(raw, None)
}

/// Text strings go out as ASCII literals when possible, UTF-16BE with
/// a BOM otherwise.
pub(crate) fn pdf_text_string(value: &str) -> LoObject {
    if value.is_ascii() {
        return LoObject::string_literal(value);
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in value.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    LoObject::String(bytes, StringFormat::Hexadecimal)
}

/// WinAnsi (CP1252) matches Latin-1 everywhere except 0x80..0x9F,
/// where it carries typographic characters instead of the C1
/// controls. Unmapped characters degrade to '?'.
pub(crate) fn winansi_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| match ch as u32 {
            0x80..=0x9F => b'?',
            cp if cp < 0x100 => cp as u8,
            _ => winansi_high_block(ch).unwrap_or(b'?'),
        })
        .collect()
}

fn winansi_high_block(ch: char) -> Option<u8> {
    Some(match ch {
        '\u{20AC}' => 0x80,
        '\u{201A}' => 0x82,
        '\u{0192}' => 0x83,
        '\u{201E}' => 0x84,
        '\u{2026}' => 0x85,
        '\u{2020}' => 0x86,
        '\u{2021}' => 0x87,
        '\u{02C6}' => 0x88,
        '\u{2030}' => 0x89,
        '\u{0160}' => 0x8A,
        '\u{2039}' => 0x8B,
        '\u{0152}' => 0x8C,
        '\u{017D}' => 0x8E,
        '\u{2018}' => 0x91,
        '\u{2019}' => 0x92,
        '\u{201C}' => 0x93,
        '\u{201D}' => 0x94,
        '\u{2022}' => 0x95,
        '\u{2013}' => 0x96,
        '\u{2014}' => 0x97,
        '\u{02DC}' => 0x98,
        '\u{2122}' => 0x99,
        '\u{0161}' => 0x9A,
        '\u{203A}' => 0x9B,
        '\u{0153}' => 0x9C,
        '\u{017E}' => 0x9E,
        '\u{0178}' => 0x9F,
        _ => return None,
    })
}

/// Adds an image XObject (plus its soft mask, if the payload carries
/// alpha) to the document and returns the stream's object id.
pub(crate) fn add_image_xobject(doc: &mut LoDocument, image: EmbeddableImage) -> ObjectId {
    let EmbeddableImage {
        width,
        height,
        color_space,
        bits_per_component,
        filter,
        data,
        alpha,
    } = image;

    let mut dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => color_space,
        "BitsPerComponent" => bits_per_component as i64,
    };
    if let Some(filter) = filter {
        dict.set("Filter", filter);
    }
    if let Some(alpha) = alpha {
        let smask_id = doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            alpha,
        ));
        dict.set("SMask", LoObject::Reference(smask_id));
    }
    doc.add_object(LoStream::new(dict, data))
}

pub(crate) fn op(operator: &str, operands: Vec<LoObject>) -> Operation {
    Operation::new(operator, operands)
}

pub(crate) fn real(value: f32) -> LoObject {
    LoObject::Real(value)
}

pub(crate) fn text_show_ops(
    size: f32,
    color: Color,
    x: f32,
    y: f32,
    text: &str,
) -> Vec<Operation> {
    vec![
        op("q", vec![]),
        op("BT", vec![]),
        op("Tf", vec![OVERLAY_FONT_RES.into(), real(size)]),
        op("rg", vec![real(color.r), real(color.g), real(color.b)]),
        op("Td", vec![real(x), real(y)]),
        op(
            "Tj",
            vec![LoObject::String(winansi_bytes(text), StringFormat::Literal)],
        ),
        op("ET", vec![]),
        op("Q", vec![]),
    ]
}

/// One WinAnsi Helvetica font object per document, shared by every
/// page that draws overlay or flattened text.
pub(crate) fn ensure_overlay_font(
    doc: &mut LoDocument,
    font_id: &mut Option<ObjectId>,
    page_id: ObjectId,
) -> Result<(), DorureError> {
    let id = match *font_id {
        Some(id) => id,
        None => {
            let id = doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "Helvetica",
                "Encoding" => "WinAnsiEncoding",
            });
            *font_id = Some(id);
            id
        }
    };
    upsert_page_resource(doc, page_id, b"Font", OVERLAY_FONT_RES, id.into())
}

/// Inserts `key` into the named resource category of one page,
/// materializing inherited or shared resource dictionaries as a
/// page-local copy first so sibling pages are unaffected.
pub(crate) fn upsert_page_resource(
    doc: &mut LoDocument,
    page_id: ObjectId,
    category: &[u8],
    key: &str,
    value: LoObject,
) -> Result<(), DorureError> {
    let mut resources: LoDictionary = {
        let page = doc
            .get_object(page_id)
            .map_err(lopdf_err)?
            .as_dict()
            .map_err(lopdf_err)?;
        match inherited_object(doc, page, b"Resources") {
            Some(LoObject::Dictionary(existing)) => existing.clone(),
            _ => LoDictionary::new(),
        }
    };
    let mut category_dict: LoDictionary = match resources.get(category) {
        Ok(obj) => match resolve_object(doc, obj)? {
            LoObject::Dictionary(existing) => existing.clone(),
            _ => LoDictionary::new(),
        },
        Err(_) => LoDictionary::new(),
    };
    category_dict.set(key, value);
    resources.set(category, LoObject::Dictionary(category_dict));

    let page = doc
        .get_object_mut(page_id)
        .map_err(lopdf_err)?
        .as_dict_mut()
        .map_err(lopdf_err)?;
    page.set("Resources", LoObject::Dictionary(resources));
    Ok(())
}

pub(crate) fn append_page_content(
    doc: &mut LoDocument,
    page_id: ObjectId,
    ops: Vec<Operation>,
) -> Result<(), DorureError> {
    let encoded = Content { operations: ops }.encode().map_err(lopdf_err)?;
    let stream_id = doc.add_object(LoStream::new(dictionary! {}, encoded));
    let mut contents = current_contents(doc, page_id)?;
    contents.push(LoObject::Reference(stream_id));
    let value = if contents.len() == 1 {
        contents.remove(0)
    } else {
        LoObject::Array(contents)
    };
    set_page_contents(doc, page_id, value)
}

pub(crate) fn wrap_page_content(doc: &mut LoDocument, page_id: ObjectId) -> Result<(), DorureError> {
    let current = current_contents(doc, page_id)?;
    if current.is_empty() {
        return Ok(());
    }
    let push_id = doc.add_object(LoStream::new(dictionary! {}, b"q\n".to_vec()));
    let pop_id = doc.add_object(LoStream::new(dictionary! {}, b"\nQ\n".to_vec()));
    let mut wrapped = Vec::with_capacity(current.len() + 2);
    wrapped.push(LoObject::Reference(push_id));
    wrapped.extend(current);
    wrapped.push(LoObject::Reference(pop_id));
    set_page_contents(doc, page_id, LoObject::Array(wrapped))
}

fn current_contents(doc: &LoDocument, page_id: ObjectId) -> Result<Vec<LoObject>, DorureError> {
    let page = doc
        .get_object(page_id)
        .map_err(lopdf_err)?
        .as_dict()
        .map_err(lopdf_err)?;
    Ok(match page.get(b"Contents") {
        Ok(obj @ LoObject::Reference(rid)) => match resolve_object(doc, obj)? {
            LoObject::Array(arr) => arr.clone(),
            _ => vec![LoObject::Reference(*rid)],
        },
        Ok(LoObject::Array(arr)) => arr.clone(),
        _ => Vec::new(),
    })
}

fn set_page_contents(
    doc: &mut LoDocument,
    page_id: ObjectId,
    contents: LoObject,
) -> Result<(), DorureError> {
    let page = doc
        .get_object_mut(page_id)
        .map_err(lopdf_err)?
        .as_dict_mut()
        .map_err(lopdf_err)?;
    page.set("Contents", contents);
    Ok(())
}
