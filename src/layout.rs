use serde::{Deserialize, Serialize};

use crate::task::{BlockKind, BoundingBox, TranslatedBlock};

const FILL_RATIO: f32 = 0.90;
const SHORT_TEXT_CHARS: usize = 10;
const SHORT_TEXT_HEIGHT_RATIO: f32 = 0.85;
const HEADER_MAX_CHARS: usize = 30;
const MIN_FONT_PX: f32 = 9.0;
const MAX_FONT_PX: f32 = 48.0;
const HEADER_FONT_PX: f32 = 14.0;

/// Page dimensions in points. Boxes are percentages of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    pub const A4: PageSize = PageSize {
        width_pt: 595.0,
        height_pt: 842.0,
    };
}

impl Default for PageSize {
    fn default() -> Self {
        Self::A4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    Start,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayoutHints {
    pub font_size_px: f32,
    pub is_header_layout: bool,
    pub is_table_layout: bool,
    pub bold: bool,
    pub align: TextAlign,
}

/// Maps a block's box and text density to typography.
///
/// The font size is the side of the square each character would get if the
/// text filled 90% of the box, then bounded for legibility.
pub fn layout(
    bbox: &BoundingBox,
    text: &str,
    kind: BlockKind,
    is_bold: bool,
    zoom: f32,
    page: PageSize,
) -> LayoutHints {
    let zoom = if zoom.is_finite() && zoom > 0.0 {
        zoom
    } else {
        1.0
    };
    let width_px = bbox.width() / 100.0 * page.width_pt * zoom;
    let height_px = bbox.height() / 100.0 * page.height_pt * zoom;
    let area = width_px * height_px;
    let char_count = text.chars().count().max(1);

    let mut font_size = (area * FILL_RATIO / char_count as f32).sqrt();
    if char_count < SHORT_TEXT_CHARS {
        font_size = font_size.min(height_px * SHORT_TEXT_HEIGHT_RATIO);
    }
    if !font_size.is_finite() {
        font_size = MIN_FONT_PX * zoom;
    }
    font_size = font_size.clamp(MIN_FONT_PX * zoom, MAX_FONT_PX * zoom);

    let is_header_layout = kind == BlockKind::Heading
        || (char_count < HEADER_MAX_CHARS && font_size > HEADER_FONT_PX * zoom);
    if kind == BlockKind::Heading {
        font_size = font_size.max(HEADER_FONT_PX * zoom);
    }
    let is_table_layout = kind == BlockKind::TableCell;

    LayoutHints {
        font_size_px: font_size,
        is_header_layout,
        is_table_layout,
        bold: is_bold || is_header_layout,
        align: if is_table_layout {
            TextAlign::Center
        } else {
            TextAlign::Start
        },
    }
}

pub fn block_layout(block: &TranslatedBlock, zoom: f32, page: PageSize) -> LayoutHints {
    layout(
        &block.bbox,
        &block.translated_text,
        block.kind,
        block.is_bold.unwrap_or(false),
        zoom,
        page,
    )
}

/// Paint order: largest boxes first so smaller overlapping text lands on top.
/// Equal areas keep the service's order.
pub fn render_order(blocks: &[TranslatedBlock]) -> Vec<&TranslatedBlock> {
    let mut ordered = blocks.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn bbox(top: f32, left: f32, bottom: f32, right: f32) -> BoundingBox {
        BoundingBox::from_ymin_xmin([top, left, bottom, right]).unwrap()
    }

    fn page(width_pt: f32, height_pt: f32) -> PageSize {
        PageSize {
            width_pt,
            height_pt,
        }
    }

    fn block_with_area(text: &str, width: f32, height: f32) -> TranslatedBlock {
        TranslatedBlock {
            id: Uuid::new_v4(),
            page_index: 0,
            original_text: text.to_string(),
            translated_text: text.to_string(),
            bbox: bbox(0.0, 0.0, height, width),
            is_bold: None,
            kind: BlockKind::Text,
        }
    }

    #[test]
    fn empty_text_counts_as_one_char() {
        let hints = layout(
            &bbox(0.0, 0.0, 10.0, 10.0),
            "",
            BlockKind::Text,
            false,
            1.0,
            PageSize::default(),
        );
        assert!(hints.font_size_px.is_finite());
        assert!(hints.font_size_px >= 9.0 && hints.font_size_px <= 48.0);
    }

    #[test]
    fn short_text_is_capped_by_box_height() {
        // 1000x1000pt page: 25% x 4% box is 250px x 40px.
        // Raw size sqrt(10000 * 0.9 / 5) = 42.4, cap 0.85 * 40 = 34.
        let hints = layout(
            &bbox(0.0, 0.0, 4.0, 25.0),
            "Hello",
            BlockKind::Text,
            false,
            1.0,
            page(1000.0, 1000.0),
        );
        let raw = (250.0f32 * 40.0 * 0.9 / 5.0).sqrt();
        let expected = raw.min(40.0 * 0.85);
        assert!((hints.font_size_px - expected).abs() < 1e-3);
        assert!((hints.font_size_px - 34.0).abs() < 1e-3);
    }

    #[test]
    fn short_text_cap_leaves_small_sizes_alone() {
        // 200px x 100px box, 5 chars: sqrt(20000 * 0.9 / 5) = 60 -> cap 85 does
        // not bind, clamp brings it to 48.
        let hints = layout(
            &bbox(0.0, 0.0, 10.0, 20.0),
            "Hello",
            BlockKind::Text,
            false,
            1.0,
            page(1000.0, 1000.0),
        );
        assert_eq!(hints.font_size_px, 48.0);
    }

    #[test]
    fn font_size_stays_within_zoomed_bounds() {
        let dense = "x".repeat(40);
        let paragraph = "long text ".repeat(200);
        let texts: [&str; 5] = ["", "a", "short", &dense, &paragraph];
        let boxes = [
            bbox(0.0, 0.0, 0.5, 0.5),
            bbox(0.0, 0.0, 100.0, 100.0),
            bbox(10.0, 10.0, 12.0, 90.0),
            bbox(50.0, 0.0, 90.0, 3.0),
        ];
        let kinds = [BlockKind::Text, BlockKind::Heading, BlockKind::TableCell];
        for zoom in [0.5f32, 1.0, 1.75, 3.0] {
            for text in texts.iter() {
                for b in boxes.iter() {
                    for kind in kinds {
                        let hints = layout(b, text, kind, false, zoom, PageSize::default());
                        assert!(
                            hints.font_size_px >= 9.0 * zoom - 1e-4
                                && hints.font_size_px <= 48.0 * zoom + 1e-4,
                            "{} out of range at zoom {}",
                            hints.font_size_px,
                            zoom
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn headings_are_floored_and_flagged() {
        let hints = layout(
            &bbox(10.0, 10.0, 11.0, 90.0),
            &"a fairly long heading that would shrink ".repeat(3),
            BlockKind::Heading,
            false,
            2.0,
            PageSize::default(),
        );
        assert!(hints.is_header_layout);
        assert!(hints.bold);
        assert!(hints.font_size_px >= 28.0);
    }

    #[test]
    fn short_large_text_is_treated_as_header() {
        let hints = layout(
            &bbox(0.0, 0.0, 5.0, 60.0),
            "Annual Report",
            BlockKind::Text,
            false,
            1.0,
            PageSize::default(),
        );
        assert!(hints.font_size_px > 14.0);
        assert!(hints.is_header_layout);
        assert!(!hints.is_table_layout);
    }

    #[test]
    fn table_cells_are_centered() {
        let hints = layout(
            &bbox(20.0, 20.0, 22.0, 30.0),
            "42.00",
            BlockKind::TableCell,
            false,
            1.0,
            PageSize::default(),
        );
        assert!(hints.is_table_layout);
        assert_eq!(hints.align, TextAlign::Center);
    }

    #[test]
    fn invalid_zoom_falls_back_to_one() {
        let b = bbox(0.0, 0.0, 10.0, 50.0);
        let base = layout(&b, "text", BlockKind::Text, false, 1.0, PageSize::default());
        let zero = layout(&b, "text", BlockKind::Text, false, 0.0, PageSize::default());
        let nan = layout(&b, "text", BlockKind::Text, false, f32::NAN, PageSize::default());
        assert_eq!(base, zero);
        assert_eq!(base, nan);
    }

    #[test]
    fn layout_is_idempotent() {
        let b = bbox(12.5, 7.0, 19.0, 93.0);
        let first = layout(&b, "Lorem ipsum", BlockKind::Text, true, 1.3, PageSize::default());
        let second = layout(&b, "Lorem ipsum", BlockKind::Text, true, 1.3, PageSize::default());
        assert_eq!(first, second);
    }

    #[test]
    fn render_order_sorts_by_descending_area() {
        let blocks = vec![
            block_with_area("ten", 10.0, 1.0),
            block_with_area("fifty", 50.0, 1.0),
            block_with_area("five", 5.0, 1.0),
        ];
        let ordered = render_order(&blocks)
            .into_iter()
            .map(|block| block.original_text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ordered, vec!["fifty", "ten", "five"]);
    }

    #[test]
    fn render_order_is_stable_on_ties() {
        let blocks = vec![
            block_with_area("first", 10.0, 2.0),
            block_with_area("big", 40.0, 40.0),
            block_with_area("second", 20.0, 1.0),
            block_with_area("third", 5.0, 4.0),
        ];
        let ordered = render_order(&blocks)
            .into_iter()
            .map(|block| block.original_text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ordered, vec!["big", "first", "second", "third"]);
    }
}
