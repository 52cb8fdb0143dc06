use std::collections::HashSet;

use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};

use crate::compose::{
    append_page_content, ensure_overlay_font, op, real, text_show_ops, wrap_page_content,
};
use crate::docmodel::{
    FIELD_FLAG_PUSHBUTTON, FIELD_FLAG_RADIO, checkbox_checked, field_value_string, inherited_i64,
    inherited_name, lopdf_err, obj_to_f32, page_annotation_ids, resolve_object, terminal_field_ids,
};
use crate::error::DorureError;
use crate::types::Color;

const VALUE_TEXT_MIN_PT: f32 = 6.0;
const VALUE_TEXT_MAX_PT: f32 = 11.0;
const VALUE_TEXT_PADDING_PT: f32 = 2.0;
const CHECK_INSET_RATIO: f32 = 0.2;
const CHECK_STROKE_PT: f32 = 1.5;

/// Bakes current field values into static page content, then strips
/// the widgets and the interactive-form dictionary. Any structural
/// failure surfaces as `FlattenFailed` so the caller can decide to
/// keep the interactive form instead.
pub(crate) fn flatten_form(doc: &mut LoDocument) -> Result<(), DorureError> {
    flatten_inner(doc).map_err(|err| match err {
        DorureError::FlattenFailed(_) => err,
        other => DorureError::FlattenFailed(other.to_string()),
    })
}

#[derive(Clone)]
enum BakedContent {
    Text(String),
    Check,
    Nothing,
}

struct BakedWidget {
    page_id: ObjectId,
    rect: [f32; 4],
    content: BakedContent,
}

fn flatten_inner(doc: &mut LoDocument) -> Result<(), DorureError> {
    let fields = terminal_field_ids(doc);
    if fields.is_empty() {
        remove_acroform(doc);
        return Ok(());
    }

    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let annots_by_page: Vec<(ObjectId, HashSet<ObjectId>)> = page_ids
        .iter()
        .map(|page_id| (*page_id, page_annotation_ids(doc, *page_id)))
        .collect();

    let mut baked: Vec<BakedWidget> = Vec::new();
    let mut widget_ids: HashSet<ObjectId> = HashSet::new();
    for (field_id, _name) in &fields {
        collect_baked_widgets(doc, *field_id, &annots_by_page, &mut baked, &mut widget_ids)?;
    }

    let mut font_id: Option<ObjectId> = None;
    let mut wrapped: HashSet<ObjectId> = HashSet::new();
    for widget in &baked {
        if !matches!(widget.content, BakedContent::Nothing) && wrapped.insert(widget.page_id) {
            wrap_page_content(doc, widget.page_id)?;
        }
        match &widget.content {
            BakedContent::Text(value) => {
                ensure_overlay_font(doc, &mut font_id, widget.page_id)?;
                let [x0, y0, _x1, y1] = widget.rect;
                let height = y1 - y0;
                let size = (height - 2.0 * VALUE_TEXT_PADDING_PT)
                    .clamp(VALUE_TEXT_MIN_PT, VALUE_TEXT_MAX_PT);
                let baseline = y0 + (height - size) * 0.5 + 1.0;
                append_page_content(
                    doc,
                    widget.page_id,
                    text_show_ops(
                        size,
                        Color::BLACK,
                        x0 + VALUE_TEXT_PADDING_PT,
                        baseline,
                        value,
                    ),
                )?;
            }
            BakedContent::Check => {
                append_page_content(doc, widget.page_id, check_mark_ops(widget.rect))?;
            }
            BakedContent::Nothing => {}
        }
    }

    strip_widget_annotations(doc, &page_ids, &widget_ids)?;
    remove_acroform(doc);
    Ok(())
}

fn collect_baked_widgets(
    doc: &LoDocument,
    field_id: ObjectId,
    annots_by_page: &[(ObjectId, HashSet<ObjectId>)],
    baked: &mut Vec<BakedWidget>,
    widget_ids: &mut HashSet<ObjectId>,
) -> Result<(), DorureError> {
    let dict = doc
        .get_object(field_id)
        .map_err(lopdf_err)?
        .as_dict()
        .map_err(lopdf_err)?;
    let content = baked_content_for_field(doc, dict);

    let mut candidates: Vec<(ObjectId, &LoDictionary)> = Vec::new();
    if dict.has(b"Rect") {
        candidates.push((field_id, dict));
    }
    if let Ok(kids) = dict.get(b"Kids").and_then(LoObject::as_array) {
        for kid in kids {
            let Ok(kid_id) = kid.as_reference() else {
                continue;
            };
            let Some(kid_dict) = doc
                .get_object(kid_id)
                .ok()
                .and_then(|obj| obj.as_dict().ok())
            else {
                continue;
            };
            // Kids carrying their own name are separate fields, not
            // widgets of this one.
            if kid_dict.has(b"T") {
                continue;
            }
            candidates.push((kid_id, kid_dict));
        }
    }

    for (widget_id, widget_dict) in candidates {
        widget_ids.insert(widget_id);
        let Some(rect) = widget_rect(doc, widget_dict) else {
            continue;
        };
        let page_id = annots_by_page
            .iter()
            .find(|(_, annots)| annots.contains(&widget_id))
            .map(|(page_id, _)| *page_id)
            .or_else(|| annots_by_page.first().map(|(page_id, _)| *page_id));
        let Some(page_id) = page_id else {
            continue;
        };
        baked.push(BakedWidget {
            page_id,
            rect,
            content: content.clone(),
        });
    }
    Ok(())
}

fn baked_content_for_field(doc: &LoDocument, dict: &LoDictionary) -> BakedContent {
    let field_type = inherited_name(doc, dict, b"FT").unwrap_or_default();
    match field_type.as_slice() {
        b"Tx" | b"Ch" => match field_value_string(doc, dict) {
            Some(value) if !value.is_empty() => BakedContent::Text(value),
            _ => BakedContent::Nothing,
        },
        b"Btn" => {
            let flags = inherited_i64(doc, dict, b"Ff").unwrap_or(0);
            if flags & (FIELD_FLAG_RADIO | FIELD_FLAG_PUSHBUTTON) != 0 {
                BakedContent::Nothing
            } else if checkbox_checked(doc, dict) {
                BakedContent::Check
            } else {
                BakedContent::Nothing
            }
        }
        _ => BakedContent::Nothing,
    }
}

fn widget_rect(doc: &LoDocument, dict: &LoDictionary) -> Option<[f32; 4]> {
    let rect_obj = dict.get(b"Rect").ok()?;
    let arr = resolve_object(doc, rect_obj).ok()?.as_array().ok()?;
    if arr.len() < 4 {
        return None;
    }
    let x0 = obj_to_f32(&arr[0])?;
    let y0 = obj_to_f32(&arr[1])?;
    let x1 = obj_to_f32(&arr[2])?;
    let y1 = obj_to_f32(&arr[3])?;
    Some([x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)])
}

fn check_mark_ops(rect: [f32; 4]) -> Vec<lopdf::content::Operation> {
    let [x0, y0, x1, y1] = rect;
    let inset = (x1 - x0).min(y1 - y0) * CHECK_INSET_RATIO;
    vec![
        op("q", vec![]),
        op("G", vec![real(0.0)]),
        op("w", vec![real(CHECK_STROKE_PT)]),
        op("m", vec![real(x0 + inset), real(y0 + inset)]),
        op("l", vec![real(x1 - inset), real(y1 - inset)]),
        op("S", vec![]),
        op("m", vec![real(x0 + inset), real(y1 - inset)]),
        op("l", vec![real(x1 - inset), real(y0 + inset)]),
        op("S", vec![]),
        op("Q", vec![]),
    ]
}

fn strip_widget_annotations(
    doc: &mut LoDocument,
    page_ids: &[ObjectId],
    removed: &HashSet<ObjectId>,
) -> Result<(), DorureError> {
    for page_id in page_ids {
        let kept: Option<Vec<LoObject>> = {
            let Ok(page) = doc.get_object(*page_id).and_then(LoObject::as_dict) else {
                continue;
            };
            match page.get(b"Annots") {
                Ok(obj) => match resolve_object(doc, obj) {
                    Ok(LoObject::Array(entries)) => Some(
                        entries
                            .iter()
                            .filter(|entry| match entry.as_reference() {
                                Ok(id) => !removed.contains(&id),
                                Err(_) => true,
                            })
                            .cloned()
                            .collect(),
                    ),
                    _ => None,
                },
                Err(_) => None,
            }
        };
        let Some(kept) = kept else {
            continue;
        };
        let page = doc
            .get_object_mut(*page_id)
            .map_err(lopdf_err)?
            .as_dict_mut()
            .map_err(lopdf_err)?;
        if kept.is_empty() {
            page.remove(b"Annots");
        } else {
            page.set("Annots", LoObject::Array(kept));
        }
    }
    Ok(())
}

fn remove_acroform(doc: &mut LoDocument) {
    let Some(root_id) = doc
        .trailer
        .get(b"Root")
        .ok()
        .and_then(|obj| obj.as_reference().ok())
    else {
        return;
    };
    if let Ok(catalog) = doc.get_object_mut(root_id).and_then(LoObject::as_dict_mut) {
        catalog.remove(b"AcroForm");
    }
}
