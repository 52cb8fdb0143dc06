use std::collections::HashSet;

use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};

use crate::error::DorureError;
use crate::types::{Pt, Size};

pub(crate) const FIELD_FLAG_RADIO: i64 = 1 << 15;
pub(crate) const FIELD_FLAG_PUSHBUTTON: i64 = 1 << 16;
pub(crate) const FIELD_FLAG_COMBO: i64 = 1 << 17;

const FIELD_TREE_MAX_DEPTH: usize = 8;

pub(crate) fn lopdf_err(err: lopdf::Error) -> DorureError {
    DorureError::MalformedDocument(err.to_string())
}

/// One page of a loaded document, with its size in PDF points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfPageRef {
    pub index: usize,
    pub width_pt: Pt,
    pub height_pt: Pt,
}

impl PdfPageRef {
    pub fn size(&self) -> Size {
        Size {
            width: self.width_pt,
            height: self.height_pt,
        }
    }
}

/// The editable value carried by a form field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text(String),
    Checkbox(bool),
    Dropdown {
        selected: Option<String>,
        options: Vec<String>,
    },
}

/// A terminal AcroForm field, addressed by its fully qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: String,
    pub kind: FieldKind,
    pub owner_page_index: usize,
}

/// Read-only structural snapshot of a PDF: page geometry plus the
/// editable form fields. Mutation happens elsewhere, on a fresh parse
/// of the same source bytes.
#[derive(Debug)]
pub struct Document {
    pages: Vec<PdfPageRef>,
    fields: Vec<FormField>,
    encrypted: bool,
}

impl Document {
    /// Decodes the document structure from raw PDF bytes.
    ///
    /// Encryption is not treated as fatal here: permission-flagged
    /// documents decode like any other, and password-protected ones
    /// fail later when their streams cannot be read.
    pub fn load(bytes: &[u8]) -> Result<Document, DorureError> {
        let inner = LoDocument::load_mem(bytes).map_err(lopdf_err)?;
        let page_map = inner.get_pages();
        if page_map.is_empty() {
            return Err(DorureError::MalformedDocument(
                "page tree resolves to zero pages".to_string(),
            ));
        }
        let mut page_ids = Vec::with_capacity(page_map.len());
        let mut pages = Vec::with_capacity(page_map.len());
        for (index, (_page_no, page_id)) in page_map.iter().enumerate() {
            let size = page_size_for_id(&inner, *page_id)?;
            page_ids.push(*page_id);
            pages.push(PdfPageRef {
                index,
                width_pt: size.width,
                height_pt: size.height,
            });
        }
        let fields = extract_form_fields(&inner, &page_ids);
        Ok(Document {
            pages,
            fields,
            encrypted: inner.is_encrypted(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[PdfPageRef] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Result<PdfPageRef, DorureError> {
        self.pages
            .get(index)
            .copied()
            .ok_or(DorureError::PageIndexOutOfRange {
                index,
                page_count: self.pages.len(),
            })
    }

    /// Terminal fields in document order. Radio groups, push buttons
    /// and list boxes are not editable here and are omitted.
    pub fn form_fields(&self) -> &[FormField] {
        &self.fields
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

fn extract_form_fields(doc: &LoDocument, page_ids: &[ObjectId]) -> Vec<FormField> {
    let annots_by_page: Vec<HashSet<ObjectId>> = page_ids
        .iter()
        .map(|page_id| page_annotation_ids(doc, *page_id))
        .collect();

    let mut out = Vec::new();
    for (field_id, name) in terminal_field_ids(doc) {
        let Ok(dict) = doc.get_object(field_id).and_then(LoObject::as_dict) else {
            continue;
        };
        let Some(kind) = classify_field(doc, dict) else {
            continue;
        };
        let owner_page_index = owner_page_for_field(field_id, dict, &annots_by_page);
        out.push(FormField {
            name,
            kind,
            owner_page_index,
        });
    }
    out
}

/// Walks the AcroForm field tree and returns every terminal field with
/// its fully qualified (dot-joined) name. Intermediate nodes are the
/// ones whose kids carry their own partial name.
pub(crate) fn terminal_field_ids(doc: &LoDocument) -> Vec<(ObjectId, String)> {
    let mut out = Vec::new();
    for field_id in acroform_field_refs(doc) {
        collect_terminal_fields(doc, field_id, "", &mut out, 0);
    }
    out
}

fn acroform_field_refs(doc: &LoDocument) -> Vec<ObjectId> {
    let refs = (|| {
        let root_id = doc.trailer.get(b"Root").ok()?.as_reference().ok()?;
        let catalog = doc.get_object(root_id).ok()?.as_dict().ok()?;
        let acroform = resolve_object(doc, catalog.get(b"AcroForm").ok()?).ok()?;
        let fields = resolve_object(doc, acroform.as_dict().ok()?.get(b"Fields").ok()?).ok()?;
        let entries = fields.as_array().ok()?;
        Some(
            entries
                .iter()
                .filter_map(|obj| obj.as_reference().ok())
                .collect(),
        )
    })();
    refs.unwrap_or_default()
}

fn collect_terminal_fields(
    doc: &LoDocument,
    field_id: ObjectId,
    prefix: &str,
    out: &mut Vec<(ObjectId, String)>,
    depth: usize,
) {
    if depth > FIELD_TREE_MAX_DEPTH {
        return;
    }
    let Ok(dict) = doc.get_object(field_id).and_then(LoObject::as_dict) else {
        return;
    };
    let partial = dict
        .get(b"T")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_str().ok())
        .map(pdf_string_to_string)
        .unwrap_or_default();
    let full_name = if prefix.is_empty() {
        partial
    } else if partial.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}.{partial}")
    };

    let named_kids: Vec<ObjectId> = match dict.get(b"Kids").and_then(LoObject::as_array) {
        Ok(kids) => kids
            .iter()
            .filter_map(|obj| obj.as_reference().ok())
            .filter(|kid_id| {
                doc.get_object(*kid_id)
                    .ok()
                    .and_then(|obj| obj.as_dict().ok())
                    .map(|kid| kid.has(b"T"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };

    if named_kids.is_empty() {
        if !full_name.is_empty() {
            out.push((field_id, full_name));
        }
        return;
    }
    for kid_id in named_kids {
        collect_terminal_fields(doc, kid_id, &full_name, out, depth + 1);
    }
}

fn classify_field(doc: &LoDocument, dict: &LoDictionary) -> Option<FieldKind> {
    let field_type = inherited_name(doc, dict, b"FT")?;
    let flags = inherited_i64(doc, dict, b"Ff").unwrap_or(0);
    match field_type.as_slice() {
        b"Tx" => Some(FieldKind::Text(
            field_value_string(doc, dict).unwrap_or_default(),
        )),
        b"Btn" => {
            if flags & (FIELD_FLAG_RADIO | FIELD_FLAG_PUSHBUTTON) != 0 {
                return None;
            }
            Some(FieldKind::Checkbox(checkbox_checked(doc, dict)))
        }
        b"Ch" => {
            if flags & FIELD_FLAG_COMBO == 0 {
                return None;
            }
            Some(FieldKind::Dropdown {
                selected: field_value_string(doc, dict),
                options: choice_options(doc, dict),
            })
        }
        _ => None,
    }
}

/// Looks up `key` on the field dictionary, then up the Parent chain.
/// FT, Ff and V are all inheritable.
pub(crate) fn inherited_object<'a>(
    doc: &'a LoDocument,
    dict: &'a LoDictionary,
    key: &[u8],
) -> Option<&'a LoObject> {
    let mut current = dict;
    for _ in 0..=FIELD_TREE_MAX_DEPTH {
        if let Ok(obj) = current.get(key) {
            return resolve_object(doc, obj).ok();
        }
        match current.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent_id) => {
                current = doc.get_object(parent_id).ok()?.as_dict().ok()?;
            }
            Err(_) => break,
        }
    }
    None
}

pub(crate) fn inherited_name(doc: &LoDocument, dict: &LoDictionary, key: &[u8]) -> Option<Vec<u8>> {
    inherited_object(doc, dict, key)?
        .as_name()
        .ok()
        .map(|name| name.to_vec())
}

pub(crate) fn inherited_i64(doc: &LoDocument, dict: &LoDictionary, key: &[u8]) -> Option<i64> {
    inherited_object(doc, dict, key)?.as_i64().ok()
}

pub(crate) fn field_value_string(doc: &LoDocument, dict: &LoDictionary) -> Option<String> {
    match inherited_object(doc, dict, b"V")? {
        LoObject::String(bytes, _) => Some(pdf_string_to_string(bytes)),
        LoObject::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

pub(crate) fn checkbox_checked(doc: &LoDocument, dict: &LoDictionary) -> bool {
    match inherited_object(doc, dict, b"V") {
        Some(LoObject::Name(name)) => name.as_slice() != b"Off",
        Some(LoObject::String(bytes, _)) => bytes.as_slice() != b"Off",
        _ => false,
    }
}

pub(crate) fn choice_options(doc: &LoDocument, dict: &LoDictionary) -> Vec<String> {
    let Some(opt) = inherited_object(doc, dict, b"Opt") else {
        return Vec::new();
    };
    let Ok(entries) = opt.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let resolved = match resolve_object(doc, entry) {
            Ok(obj) => obj,
            Err(_) => continue,
        };
        let text = match resolved {
            LoObject::String(bytes, _) => Some(pdf_string_to_string(bytes)),
            // An [export, display] pair exposes its display text.
            LoObject::Array(pair) => pair
                .last()
                .and_then(|obj| obj.as_str().ok())
                .map(pdf_string_to_string),
            _ => None,
        };
        if let Some(text) = text {
            out.push(text);
        }
    }
    out
}

fn owner_page_for_field(
    field_id: ObjectId,
    dict: &LoDictionary,
    annots_by_page: &[HashSet<ObjectId>],
) -> usize {
    let mut widget_ids = vec![field_id];
    if let Ok(kids) = dict.get(b"Kids").and_then(LoObject::as_array) {
        widget_ids.extend(kids.iter().filter_map(|obj| obj.as_reference().ok()));
    }
    // First page whose annotation array carries one of the widgets wins.
    for (index, annots) in annots_by_page.iter().enumerate() {
        if widget_ids.iter().any(|id| annots.contains(id)) {
            return index;
        }
    }
    0
}

pub(crate) fn page_annotation_ids(doc: &LoDocument, page_id: ObjectId) -> HashSet<ObjectId> {
    let mut out = HashSet::new();
    let Ok(dict) = doc.get_object(page_id).and_then(LoObject::as_dict) else {
        return out;
    };
    let Ok(annots_obj) = dict.get(b"Annots") else {
        return out;
    };
    let resolved = match resolve_object(doc, annots_obj) {
        Ok(obj) => obj,
        Err(_) => return out,
    };
    if let Ok(entries) = resolved.as_array() {
        out.extend(entries.iter().filter_map(|obj| obj.as_reference().ok()));
    }
    out
}

pub(crate) fn resolve_object<'a>(
    doc: &'a LoDocument,
    mut obj: &'a LoObject,
) -> Result<&'a LoObject, DorureError> {
    loop {
        match obj {
            LoObject::Reference(id) => {
                obj = doc.get_object(*id).map_err(lopdf_err)?;
            }
            _ => return Ok(obj),
        }
    }
}

pub(crate) fn page_size_for_id(doc: &LoDocument, mut id: ObjectId) -> Result<Size, DorureError> {
    loop {
        let dict = doc
            .get_object(id)
            .map_err(lopdf_err)?
            .as_dict()
            .map_err(lopdf_err)?;
        if let Ok(arr) = dict.get(b"MediaBox").and_then(LoObject::as_array) {
            if let Some(size) = parse_media_box_array(arr) {
                return Ok(size);
            }
        }
        id = match dict.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent_id) => parent_id,
            Err(_) => break,
        };
    }
    Ok(Size::letter())
}

fn parse_media_box_array(arr: &[LoObject]) -> Option<Size> {
    if arr.len() < 4 {
        return None;
    }
    let x0 = obj_to_f32(&arr[0])?;
    let y0 = obj_to_f32(&arr[1])?;
    let x1 = obj_to_f32(&arr[2])?;
    let y1 = obj_to_f32(&arr[3])?;
    let width = (x1 - x0).abs().max(1.0);
    let height = (y1 - y0).abs().max(1.0);
    Some(Size {
        width: Pt::from_f32(width),
        height: Pt::from_f32(height),
    })
}

pub(crate) fn obj_to_f32(obj: &LoObject) -> Option<f32> {
    if let Ok(v) = obj.as_float() {
        return Some(v);
    }
    obj.as_i64().ok().map(|v| v as f32)
}

/// Decodes a PDF text string: UTF-16BE when it carries the BOM,
/// otherwise treated as (mostly ASCII) PDFDocEncoding.
pub(crate) fn pdf_string_to_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let utf16: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&utf16)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{Stream as LoStream, dictionary};

    fn two_page_form_pdf() -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page1_id = doc.new_object_id();
        let page2_id = doc.new_object_id();

        // Text field split into a parent node and a named widget kid.
        let kid_name_id = doc.new_object_id();
        let parent_client_id = doc.add_object(dictionary! {
            "FT" => "Tx",
            "T" => LoObject::string_literal("client"),
            "Kids" => vec![kid_name_id.into()],
        });
        doc.objects.insert(
            kid_name_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Annot",
                "Subtype" => "Widget",
                "T" => LoObject::string_literal("name"),
                "Parent" => parent_client_id,
                "V" => LoObject::string_literal("Ada"),
                "Rect" => vec![100.into(), 600.into(), 300.into(), 620.into()],
            }),
        );

        let check_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Btn",
            "T" => LoObject::string_literal("subscribe"),
            "V" => "Yes",
            "Rect" => vec![100.into(), 560.into(), 120.into(), 580.into()],
        });

        let dropdown_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Ch",
            "Ff" => FIELD_FLAG_COMBO,
            "T" => LoObject::string_literal("country"),
            "V" => LoObject::string_literal("France"),
            "Opt" => vec![
                LoObject::string_literal("France"),
                vec![
                    LoObject::string_literal("DE"),
                    LoObject::string_literal("Allemagne"),
                ]
                .into(),
            ],
            "Rect" => vec![100.into(), 520.into(), 260.into(), 540.into()],
        });

        // None of these three should surface as editable fields.
        let radio_id = doc.add_object(dictionary! {
            "FT" => "Btn",
            "Ff" => FIELD_FLAG_RADIO,
            "T" => LoObject::string_literal("color"),
        });
        let push_id = doc.add_object(dictionary! {
            "FT" => "Btn",
            "Ff" => FIELD_FLAG_PUSHBUTTON,
            "T" => LoObject::string_literal("submit"),
        });
        let listbox_id = doc.add_object(dictionary! {
            "FT" => "Ch",
            "T" => LoObject::string_literal("multi"),
        });

        let notes_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Tx",
            "T" => LoObject::string_literal("notes"),
            "Rect" => vec![100.into(), 700.into(), 400.into(), 720.into()],
        });

        let content1_id = doc.add_object(LoStream::new(dictionary! {}, b"q Q".to_vec()));
        let content2_id = doc.add_object(LoStream::new(dictionary! {}, b"q Q".to_vec()));
        doc.objects.insert(
            page1_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content1_id,
                "Annots" => vec![kid_name_id.into(), check_id.into(), dropdown_id.into()],
            }),
        );
        doc.objects.insert(
            page2_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content2_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
                "Annots" => vec![notes_id.into()],
            }),
        );
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page1_id.into(), page2_id.into()],
                "Count" => 2,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );

        let acroform_id = doc.add_object(dictionary! {
            "Fields" => vec![
                parent_client_id.into(),
                check_id.into(),
                dropdown_id.into(),
                radio_id.into(),
                push_id.into(),
                listbox_id.into(),
                notes_id.into(),
            ],
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
            "AcroForm" => acroform_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn load_reads_page_sizes_with_inheritance() {
        let doc = Document::load(&two_page_form_pdf()).unwrap();
        assert_eq!(doc.page_count(), 2);
        assert!(!doc.is_encrypted());
        // Page 1 inherits the Pages-level MediaBox, page 2 overrides it.
        assert_eq!(doc.pages()[0].size(), Size::letter());
        let second = doc.page(1).unwrap();
        assert_eq!(second.width_pt, Pt::from_i32(595));
        assert_eq!(second.height_pt, Pt::from_i32(842));
    }

    #[test]
    fn page_out_of_range_is_reported() {
        let doc = Document::load(&two_page_form_pdf()).unwrap();
        match doc.page(2) {
            Err(DorureError::PageIndexOutOfRange { index, page_count }) => {
                assert_eq!(index, 2);
                assert_eq!(page_count, 2);
            }
            other => panic!("expected page index error, got {other:?}"),
        }
    }

    #[test]
    fn form_fields_are_classified_and_named() {
        let doc = Document::load(&two_page_form_pdf()).unwrap();
        let fields = doc.form_fields();
        assert_eq!(fields.len(), 4);

        let by_name = |name: &str| {
            fields
                .iter()
                .find(|f| f.name == name)
                .unwrap_or_else(|| panic!("missing field {name}"))
        };

        assert_eq!(by_name("client.name").kind, FieldKind::Text("Ada".to_string()));
        assert_eq!(by_name("client.name").owner_page_index, 0);
        assert_eq!(by_name("subscribe").kind, FieldKind::Checkbox(true));
        assert_eq!(
            by_name("country").kind,
            FieldKind::Dropdown {
                selected: Some("France".to_string()),
                options: vec!["France".to_string(), "Allemagne".to_string()],
            }
        );
        // Widget parked on the second page follows its page.
        assert_eq!(by_name("notes").kind, FieldKind::Text(String::new()));
        assert_eq!(by_name("notes").owner_page_index, 1);

        // Radio groups, push buttons and list boxes stay out.
        assert!(fields.iter().all(|f| f.name != "color"));
        assert!(fields.iter().all(|f| f.name != "submit"));
        assert!(fields.iter().all(|f| f.name != "multi"));
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        match Document::load(b"not a pdf at all") {
            Err(DorureError::MalformedDocument(_)) => {}
            other => panic!("expected malformed document error, got {other:?}"),
        }
    }

    #[test]
    fn utf16_text_strings_decode() {
        // "Zo\u{e9}" with the UTF-16BE BOM.
        let bytes = [0xFE, 0xFF, 0x00, 0x5A, 0x00, 0x6F, 0x00, 0xE9];
        assert_eq!(pdf_string_to_string(&bytes), "Zo\u{e9}");
        assert_eq!(pdf_string_to_string(b"plain"), "plain");
    }
}
