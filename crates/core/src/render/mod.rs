//! Slide renderer: gradient background, orbiting discs and centred caption
//! drawn into a `tiny-skia` pixmap.

pub mod font;

use std::f32::consts::TAU;
use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbaImage};
use tiny_skia::{
    Color, FillRule, GradientStop, LinearGradient, Paint, PathBuilder, Pixmap, Point, Rect,
    SpreadMode, Transform,
};

use crate::{Result, SlidecastError};

/// Fixed size of the still thumbnail produced at the end of a recording.
pub const THUMBNAIL_WIDTH: u32 = 1280;
pub const THUMBNAIL_HEIGHT: u32 = 720;

const HUE_STEP: u32 = 47;
const SECOND_STOP_HUE_OFFSET: u32 = 120;
const DISC_COUNT: usize = 12;
const DISC_ANGULAR_SPEED: f32 = 0.2;
const DISC_ALPHA: f32 = 0.15;
const MIN_FONT_SIZE: f32 = 20.0;
const MAX_FONT_SIZE: f32 = 64.0;
const LINE_HEIGHT: f32 = 1.4;
const MAX_LINE_FRACTION: f32 = 0.9;
const VERTICAL_SCALE_EXPONENT: f32 = 0.85;
const SHADOW_ALPHA: u8 = 140;

/// Raster target for slide frames.
pub struct Surface {
    pixmap: Pixmap,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let pixmap = Pixmap::new(width, height).ok_or_else(|| {
            SlidecastError::Surface(format!("cannot allocate a {width}x{height} surface"))
        })?;
        Ok(Self { pixmap })
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Straight-alpha RGBA pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let color = self.pixmap.pixel(x, y)?.demultiply();
        Some([color.red(), color.green(), color.blue(), color.alpha()])
    }

    /// Copies the surface out as straight-alpha RGBA bytes.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixmap.pixels().len() * 4);
        for pixel in self.pixmap.pixels() {
            let color = pixel.demultiply();
            out.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
        }
        out
    }

    /// Copies the surface out as packed RGB bytes, dropping alpha.
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixmap.pixels().len() * 3);
        for pixel in self.pixmap.pixels() {
            let color = pixel.demultiply();
            out.extend_from_slice(&[color.red(), color.green(), color.blue()]);
        }
        out
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let image = RgbaImage::from_raw(self.width(), self.height(), self.to_rgba())
            .ok_or_else(|| SlidecastError::Surface("pixel buffer size mismatch".into()))?;
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Placement of one caption line, relative to the surface.
#[derive(Debug, Clone, PartialEq)]
pub struct LineLayout {
    pub text: String,
    pub center_y: f32,
    /// Unscaled width in pixels.
    pub width: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

/// Caption layout for a whole slide. Depends only on text and surface size.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub font_size: f32,
    pub lines: Vec<LineLayout>,
}

impl TextLayout {
    pub fn compute(text: &str, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let font_size = font_size_for(width);
        let cell = font_size / font::GLYPH_BOX as f32;
        let lines: Vec<&str> = text.split('\n').collect();
        let total = lines.len() as f32;

        let lines = lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let width = font::line_width_cells(line.chars().count()) as f32 * cell;
                let scale_x = ((w * MAX_LINE_FRACTION) / (width + 1.0)).min(1.0);
                LineLayout {
                    text: line.to_string(),
                    center_y: h / 2.0 + (i as f32 - (total - 1.0) / 2.0) * font_size * LINE_HEIGHT,
                    width,
                    scale_x,
                    scale_y: scale_x.powf(VERTICAL_SCALE_EXPONENT),
                }
            })
            .collect();

        Self { font_size, lines }
    }
}

/// Font size in pixels for a surface `width` pixels wide.
pub fn font_size_for(width: u32) -> f32 {
    (width as f32 / 20.0).floor().clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}

/// Background gradient hues for a slide: the first stop and the second stop.
pub fn slide_hues(slide_index: usize) -> (u32, u32) {
    let base = (slide_index as u64 * HUE_STEP as u64 % 360) as u32;
    (base, (base + SECOND_STOP_HUE_OFFSET) % 360)
}

/// Centre of orbiting disc `i` at `elapsed_seconds` on a `w`×`h` surface.
pub fn disc_center(i: usize, w: f32, h: f32, elapsed_seconds: f64) -> (f32, f32) {
    let angle = (i as f32 / DISC_COUNT as f32) * TAU + elapsed_seconds as f32 * DISC_ANGULAR_SPEED;
    let radius = w.min(h) * (0.1 + (i % 3) as f32 * 0.07);
    (w / 2.0 + angle.cos() * radius, h / 2.0 + angle.sin() * radius)
}

/// Draws slides. Output is a deterministic function of text, slide index and
/// elapsed time; only the disc motion depends on time.
#[derive(Debug, Clone)]
pub struct SlideRenderer {
    fallback_label: String,
}

impl Default for SlideRenderer {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

impl SlideRenderer {
    pub fn new(fallback_label: impl Into<String>) -> Self {
        Self {
            fallback_label: fallback_label.into(),
        }
    }

    pub fn render(&self, surface: &mut Surface, text: &str, slide_index: usize, elapsed_seconds: f64) {
        let text = if text.trim().is_empty() {
            self.fallback_label.as_str()
        } else {
            text
        };
        let (w, h) = (surface.width() as f32, surface.height() as f32);
        let pixmap = &mut surface.pixmap;

        draw_background(pixmap, w, h, slide_index);
        draw_discs(pixmap, w, h, slide_index, elapsed_seconds);

        let layout = TextLayout::compute(text, surface.width(), surface.height());
        draw_caption(&mut surface.pixmap, w, &layout);
    }

    /// Renders slide 0 onto a fresh thumbnail-sized surface at elapsed zero
    /// and encodes it as PNG.
    pub fn thumbnail_png(&self, text: &str) -> Result<Vec<u8>> {
        let mut surface = Surface::new(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)?;
        self.render(&mut surface, text, 0, 0.0);
        surface.encode_png()
    }
}

fn draw_background(pixmap: &mut Pixmap, w: f32, h: f32, slide_index: usize) {
    let (from, to) = slide_hues(slide_index);
    let mut paint = Paint::default();
    paint.shader = match LinearGradient::new(
        Point::from_xy(0.0, 0.0),
        Point::from_xy(w, h),
        vec![
            GradientStop::new(0.0, hsla(from as f32, 0.8, 0.2, 1.0)),
            GradientStop::new(1.0, hsla(to as f32, 0.8, 0.4, 1.0)),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    ) {
        Some(shader) => shader,
        None => {
            pixmap.fill(hsla(from as f32, 0.8, 0.2, 1.0));
            return;
        }
    };

    if let Some(rect) = Rect::from_xywh(0.0, 0.0, w, h) {
        pixmap.fill_rect(rect, &paint, Transform::identity(), None);
    }
}

fn draw_discs(pixmap: &mut Pixmap, w: f32, h: f32, slide_index: usize, elapsed_seconds: f64) {
    let mut paint = Paint::default();
    paint.anti_alias = true;

    for i in 0..DISC_COUNT {
        let (x, y) = disc_center(i, w, h, elapsed_seconds);
        let radius = 40.0 + (i % 5) as f32 * 6.0;
        let hue = ((slide_index as u64 * HUE_STEP as u64 + i as u64 * 15) % 360) as f32;
        paint.set_color(hsla(hue, 0.9, 0.7, DISC_ALPHA));
        if let Some(path) = PathBuilder::from_circle(x, y, radius) {
            pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
        }
    }
}

fn draw_caption(pixmap: &mut Pixmap, w: f32, layout: &TextLayout) {
    let cell = layout.font_size / font::GLYPH_BOX as f32;
    let shadow_offset = cell * 0.4;

    let mut shadow = Paint::default();
    shadow.set_color_rgba8(0, 0, 0, SHADOW_ALPHA);
    let mut ink = Paint::default();
    ink.set_color(Color::WHITE);

    for line in &layout.lines {
        let Some(path) = line_path(&line.text, line.width, cell) else {
            continue;
        };
        let place = |dx: f32, dy: f32| {
            Transform::from_row(line.scale_x, 0.0, 0.0, line.scale_y, w / 2.0 + dx, line.center_y + dy)
        };
        pixmap.fill_path(&path, &shadow, FillRule::Winding, place(shadow_offset, shadow_offset), None);
        pixmap.fill_path(&path, &ink, FillRule::Winding, place(0.0, 0.0), None);
    }
}

/// Glyph cells of one line, centred on the origin.
fn line_path(text: &str, width: f32, cell: f32) -> Option<tiny_skia::Path> {
    let mut builder = PathBuilder::new();
    let left = -width / 2.0;
    let top = -(font::GLYPH_ROWS as f32 * cell) / 2.0;

    for (i, ch) in text.chars().enumerate() {
        let origin = left + (i * font::GLYPH_ADVANCE) as f32 * cell;
        for (col, row) in font::lit_cells(ch) {
            if let Some(rect) =
                Rect::from_xywh(origin + col as f32 * cell, top + row as f32 * cell, cell, cell)
            {
                builder.push_rect(rect);
            }
        }
    }

    builder.finish()
}

/// `hsla()` in the CSS sense: hue in degrees, the rest in [0, 1].
fn hsla(hue: f32, saturation: f32, lightness: f32, alpha: f32) -> Color {
    let c = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let h = (hue.rem_euclid(360.0)) / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = lightness - c / 2.0;
    Color::from_rgba(
        (r + m).clamp(0.0, 1.0),
        (g + m).clamp(0.0, 1.0),
        (b + m).clamp(0.0, 1.0),
        alpha.clamp(0.0, 1.0),
    )
    .unwrap_or(Color::BLACK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hues_follow_slide_index() {
        assert_eq!(slide_hues(0), (0, 120));
        assert_eq!(slide_hues(1), (47, 167));
        assert_eq!(slide_hues(8), (16, 136));
    }

    #[test]
    fn font_size_is_clamped() {
        assert_eq!(font_size_for(200), MIN_FONT_SIZE);
        assert_eq!(font_size_for(800), 40.0);
        assert_eq!(font_size_for(4000), MAX_FONT_SIZE);
    }

    #[test]
    fn short_lines_are_not_scaled() {
        let layout = TextLayout::compute("Hi", 1280, 720);
        assert_eq!(layout.lines[0].scale_x, 1.0);
        assert_eq!(layout.lines[0].scale_y, 1.0);
        assert_eq!(layout.lines[0].center_y, 360.0);
    }

    #[test]
    fn long_lines_shrink_with_softer_vertical_scale() {
        let long = "W".repeat(120);
        let layout = TextLayout::compute(&long, 640, 360);
        let line = &layout.lines[0];
        assert!(line.scale_x < 1.0);
        assert!(line.width * line.scale_x <= 640.0 * MAX_LINE_FRACTION);
        assert!((line.scale_y - line.scale_x.powf(0.85)).abs() < 1e-6);
        assert!(line.scale_y > line.scale_x);
    }

    #[test]
    fn lines_are_centred_as_a_block() {
        let layout = TextLayout::compute("one\ntwo\nthree", 1280, 720);
        let ys: Vec<f32> = layout.lines.iter().map(|l| l.center_y).collect();
        let spacing = layout.font_size * LINE_HEIGHT;
        assert_eq!(ys, vec![360.0 - spacing, 360.0, 360.0 + spacing]);
    }

    #[test]
    fn rejects_zero_sized_surface() {
        assert!(matches!(Surface::new(0, 10), Err(SlidecastError::Surface(_))));
    }

    #[test]
    fn background_is_time_independent_and_discs_move() {
        let renderer = SlideRenderer::default();
        let mut early = Surface::new(320, 180).unwrap();
        let mut late = Surface::new(320, 180).unwrap();
        renderer.render(&mut early, "Hello", 0, 0.0);
        renderer.render(&mut late, "Hello", 0, 7.5);

        assert_eq!(early.pixel(0, 0), late.pixel(0, 0));
        assert_eq!(early.pixel(319, 179), late.pixel(319, 179));
        assert_ne!(disc_center(0, 320.0, 180.0, 0.0), disc_center(0, 320.0, 180.0, 7.5));
        assert_eq!(
            TextLayout::compute("Hello", 320, 180),
            TextLayout::compute("Hello", 320, 180)
        );
    }

    #[test]
    fn different_slides_get_different_backgrounds() {
        let renderer = SlideRenderer::default();
        let mut first = Surface::new(64, 36).unwrap();
        let mut second = Surface::new(64, 36).unwrap();
        renderer.render(&mut first, "A", 0, 0.0);
        renderer.render(&mut second, "A", 1, 0.0);
        assert_ne!(first.pixel(0, 0), second.pixel(0, 0));
    }

    #[test]
    fn empty_text_uses_fallback_label() {
        let renderer = SlideRenderer::new("Untitled");
        let mut blank = Surface::new(160, 90).unwrap();
        let mut labelled = Surface::new(160, 90).unwrap();
        renderer.render(&mut blank, "  ", 2, 1.0);
        renderer.render(&mut labelled, "Untitled", 2, 1.0);
        assert_eq!(blank.to_rgba(), labelled.to_rgba());
    }

    #[test]
    fn caption_draws_white_ink() {
        let renderer = SlideRenderer::default();
        let mut surface = Surface::new(400, 200).unwrap();
        renderer.render(&mut surface, "HHHH", 0, 0.0);
        let has_white = surface
            .to_rgba()
            .chunks(4)
            .any(|px| px[0] >= 240 && px[1] >= 240 && px[2] >= 240);
        assert!(has_white);
    }

    #[test]
    fn thumbnail_is_png_at_fixed_size() {
        let png = SlideRenderer::default().thumbnail_png("Hello").unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT));
    }
}
