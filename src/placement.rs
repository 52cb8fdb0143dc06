use crate::types::Color;

const PLACE_ANCHOR_OFFSET_X: f32 = -0.1;
const PLACE_ANCHOR_OFFSET_Y: f32 = -0.025;
const PLACE_MAX_X: f32 = 0.8;
const PLACE_MAX_Y: f32 = 0.9;
const MOVE_MAX: f32 = 0.95;
const RESIZE_MIN_WIDTH: f32 = 0.05;
const RESIZE_MAX_WIDTH: f32 = 0.70;
const DEFAULT_SIGNATURE_WIDTH: f32 = 0.20;
const DEFAULT_STAMP_WIDTH: f32 = 0.15;
const FONT_SIZE_MIN: f32 = 6.0;
const FONT_SIZE_MAX: f32 = 72.0;
const DEFAULT_FONT_SIZE: f32 = 14.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacedItemKind {
    Signature,
    Stamp,
    TextAnnotation,
}

/// What an overlay item draws: decoded-on-export image bytes (raw or a
/// base64 data URI) or a literal string.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacedContent {
    Image(Vec<u8>),
    Text(String),
}

/// A user-positioned overlay. Coordinates live in percentage space
/// (top-left anchor, [0,1) of the page box) so they survive zoom and
/// re-render; heights are never stored, they derive from the content's
/// aspect ratio at export time.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedItem {
    pub id: u64,
    pub kind: PlacedItemKind,
    pub page_index: usize,
    pub x_percent: f32,
    pub y_percent: f32,
    pub width_percent: f32,
    pub font_size_pt: f32,
    pub color: Color,
    pub content: PlacedContent,
    pub timestamp_label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DragMode {
    Move,
    Resize,
}

#[derive(Debug, Clone, Copy)]
struct DragOrigin {
    id: u64,
    mode: DragMode,
    x: f32,
    y: f32,
    width: f32,
}

/// Holds every placed overlay for the open document, plus the current
/// selection and at most one in-flight drag (single pointer device).
pub struct PlacementBoard {
    items: Vec<PlacedItem>,
    next_id: u64,
    selected: Option<u64>,
    drag: Option<DragOrigin>,
}

impl PlacementBoard {
    pub fn new() -> PlacementBoard {
        PlacementBoard {
            items: Vec::new(),
            next_id: 1,
            selected: None,
            drag: None,
        }
    }

    /// Places a new item so the click point lands inside its box: the
    /// anchor is the click offset by a fixed fraction of the default
    /// box, then clamped so the item never starts fully off-canvas.
    ///
    /// `timestamp_label` attaches to signature and stamp placements
    /// only, and only when `timestamp_allowed` is true at this moment;
    /// entitlement is not re-checked later.
    pub fn place(
        &mut self,
        kind: PlacedItemKind,
        content: PlacedContent,
        page_index: usize,
        click_x_percent: f32,
        click_y_percent: f32,
        timestamp_label: Option<String>,
        timestamp_allowed: bool,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let x = (click_x_percent + PLACE_ANCHOR_OFFSET_X).clamp(0.0, PLACE_MAX_X);
        let y = (click_y_percent + PLACE_ANCHOR_OFFSET_Y).clamp(0.0, PLACE_MAX_Y);
        let width_percent = match kind {
            PlacedItemKind::Signature | PlacedItemKind::TextAnnotation => DEFAULT_SIGNATURE_WIDTH,
            PlacedItemKind::Stamp => DEFAULT_STAMP_WIDTH,
        };
        self.items.push(PlacedItem {
            id,
            kind,
            page_index,
            x_percent: x,
            y_percent: y,
            width_percent,
            font_size_pt: DEFAULT_FONT_SIZE,
            color: Color::BLACK,
            content,
            timestamp_label: match kind {
                PlacedItemKind::Signature | PlacedItemKind::Stamp if timestamp_allowed => {
                    timestamp_label
                }
                _ => None,
            },
        });
        self.selected = Some(id);
        id
    }

    pub fn items(&self) -> &[PlacedItem] {
        &self.items
    }

    pub fn items_on_page(&self, page_index: usize) -> impl Iterator<Item = &PlacedItem> {
        self.items
            .iter()
            .filter(move |item| item.page_index == page_index)
    }

    pub fn item(&self, id: u64) -> Option<&PlacedItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn selected(&self) -> Option<u64> {
        self.selected
    }

    pub fn select(&mut self, id: u64) -> bool {
        if self.item(id).is_some() {
            self.selected = Some(id);
            true
        } else {
            false
        }
    }

    /// Snapshots the item's position as the drag origin. Starting a new
    /// drag replaces any active one; the single slot is what enforces
    /// the one-drag-at-a-time rule.
    pub fn begin_move(&mut self, id: u64) -> bool {
        self.begin_drag(id, DragMode::Move)
    }

    pub fn begin_resize(&mut self, id: u64) -> bool {
        self.begin_drag(id, DragMode::Resize)
    }

    fn begin_drag(&mut self, id: u64, mode: DragMode) -> bool {
        let Some(item) = self.item(id) else {
            return false;
        };
        self.drag = Some(DragOrigin {
            id,
            mode,
            x: item.x_percent,
            y: item.y_percent,
            width: item.width_percent,
        });
        true
    }

    /// Applies the pointer delta against the drag origin (not the
    /// item's last position, so jittery events never accumulate).
    /// Move clamps each axis into [0, 0.95]; resize adds the x delta
    /// to the origin width, clamped into [0.05, 0.70].
    pub fn update_drag(&mut self, id: u64, delta_x_percent: f32, delta_y_percent: f32) -> bool {
        let Some(origin) = self.drag else {
            return false;
        };
        if origin.id != id {
            return false;
        }
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        match origin.mode {
            DragMode::Move => {
                item.x_percent = (origin.x + delta_x_percent).clamp(0.0, MOVE_MAX);
                item.y_percent = (origin.y + delta_y_percent).clamp(0.0, MOVE_MAX);
            }
            DragMode::Resize => {
                item.width_percent =
                    (origin.width + delta_x_percent).clamp(RESIZE_MIN_WIDTH, RESIZE_MAX_WIDTH);
            }
        }
        true
    }

    pub fn end_drag(&mut self, id: u64) {
        if self.drag.map(|origin| origin.id) == Some(id) {
            self.drag = None;
        }
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        if self.items.len() == before {
            return false;
        }
        if self.selected == Some(id) {
            self.selected = None;
        }
        if self.drag.map(|origin| origin.id) == Some(id) {
            self.drag = None;
        }
        true
    }

    pub fn set_font_size(&mut self, id: u64, size_pt: f32) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        item.font_size_pt = size_pt.clamp(FONT_SIZE_MIN, FONT_SIZE_MAX);
        true
    }

    pub fn set_color(&mut self, id: u64, color: Color) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        item.color = color;
        true
    }

    /// Document reset: every item is destroyed, selection and drag
    /// state included.
    pub fn clear(&mut self) {
        self.items.clear();
        self.selected = None;
        self.drag = None;
    }
}

impl Default for PlacementBoard {
    fn default() -> Self {
        PlacementBoard::new()
    }
}
