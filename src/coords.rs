use crate::types::{Pt, Size};

// Percentage coordinates anchor at the top-left like the rendered bitmap; PDF space
// anchors at the bottom-left. The item's own height shifts the anchor so that a
// top-left percentage anchor lands on the drawn box's bottom-left corner in PDF space.
pub fn to_pdf_space(x_percent: f32, y_percent: f32, page: Size, item_height: Pt) -> (Pt, Pt) {
    let x = page.width * x_percent;
    let y = page.height - page.height * y_percent - item_height;
    (x, y)
}

// Screen pixel -> percentage, relative to the rendered canvas box. No clamping here;
// placement owns its own bounds.
pub fn to_percent_space(
    click_x: f32,
    click_y: f32,
    canvas_origin_x: f32,
    canvas_origin_y: f32,
    canvas_width: f32,
    canvas_height: f32,
) -> (f32, f32) {
    let x = if canvas_width > 0.0 {
        (click_x - canvas_origin_x) / canvas_width
    } else {
        0.0
    };
    let y = if canvas_height > 0.0 {
        (click_y - canvas_origin_y) / canvas_height
    } else {
        0.0
    };
    (x, y)
}
