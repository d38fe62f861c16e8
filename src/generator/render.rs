//! PNG card renderer.
//!
//! Layout (900×450): circular owner avatar top-right, `owner / repo` title
//! top-left, up to three lines of description, a stats row with drawn icons
//! and a four-colour bar along the bottom edge.  Text is drawn with the
//! first loadable font from the configured candidates; without one the card
//! still renders, shapes only.

use std::io::Cursor;

use ab_glyph::{FontVec, PxScale};
use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_line_segment_mut,
    draw_polygon_mut, draw_text_mut, text_size,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::config::RenderConfig;
use crate::error::CardError;

pub const WIDTH: u32 = 900;
pub const HEIGHT: u32 = 450;

const AVATAR_SIZE: u32 = 140;
const AVATAR_X: i32 = WIDTH as i32 - 200;
const AVATAR_Y: i32 = 50;
const CONTENT_LEFT: i32 = 60;
const CONTENT_RIGHT_MARGIN: i32 = 40;
const TITLE_Y: i32 = 60;
const DESCRIPTION_LINES: usize = 3;
const DESCRIPTION_LINE_HEIGHT: i32 = 30;
const STATS_Y: i32 = HEIGHT as i32 - 100;
const ICON_SIZE: i32 = 20;
const COLOR_BAR_HEIGHT: u32 = 12;

const BACKGROUND: Rgba<u8> = Rgba([246, 248, 250, 255]);
const TEXT_PRIMARY: Rgba<u8> = Rgba([31, 35, 40, 255]);
const TEXT_MUTED: Rgba<u8> = Rgba([101, 109, 118, 255]);
const ICON: Rgba<u8> = Rgba([87, 96, 106, 255]);
const PLACEHOLDER: Rgba<u8> = Rgba([208, 215, 222, 255]);
const BAR_COLORS: [Rgba<u8>; 4] = [
    Rgba([234, 67, 53, 255]),
    Rgba([251, 188, 4, 255]),
    Rgba([52, 168, 83, 255]),
    Rgba([66, 133, 244, 255]),
];

/// Everything printed on a card.
#[derive(Debug, Clone, Default)]
pub struct CardContent {
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub issues: u64,
    pub contributors: u64,
    /// Raw avatar image bytes in any format `image` can decode.
    pub avatar: Option<Bytes>,
}

#[derive(Debug, Clone, Copy)]
enum Icon {
    Contributors,
    Issue,
    Fork,
    Star,
}

pub struct CardRenderer {
    font: Option<FontVec>,
}

impl CardRenderer {
    /// Load the first readable font among `config.font_paths`.
    pub fn new(config: &RenderConfig) -> Self {
        for path in &config.font_paths {
            let Ok(data) = std::fs::read(path) else {
                continue;
            };
            match FontVec::try_from_vec_and_index(data, 0) {
                Ok(font) => {
                    info!(%path, "card font loaded");
                    return Self { font: Some(font) };
                }
                Err(e) => warn!(%path, error = %e, "unusable font file"),
            }
        }
        warn!("no usable font found; cards will be rendered without text");
        Self::without_font()
    }

    pub fn without_font() -> Self {
        Self { font: None }
    }

    /// Draw the card and encode it as PNG.
    pub fn render(&self, content: &CardContent) -> Result<Vec<u8>, CardError> {
        let mut canvas = RgbaImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);

        self.draw_avatar(&mut canvas, content.avatar.as_deref());
        let title_end = self.draw_title(&mut canvas, &content.owner, &content.name);
        self.draw_description(&mut canvas, content.description.as_deref(), title_end);
        self.draw_stats(&mut canvas, content);
        draw_color_bar(&mut canvas);

        let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(rgb)
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| CardError::Internal(format!("PNG encoding failed: {e}")))?;
        Ok(out.into_inner())
    }

    fn draw_avatar(&self, canvas: &mut RgbaImage, avatar: Option<&[u8]>) {
        let decoded = avatar.and_then(|bytes| match image::load_from_memory(bytes) {
            Ok(img) => Some(img),
            Err(e) => {
                debug!(error = %e, "avatar could not be decoded");
                None
            }
        });

        match decoded {
            Some(img) => {
                let mut avatar =
                    imageops::resize(&img.to_rgba8(), AVATAR_SIZE, AVATAR_SIZE, FilterType::Lanczos3);
                mask_circle(&mut avatar);
                imageops::overlay(canvas, &avatar, i64::from(AVATAR_X), i64::from(AVATAR_Y));
            }
            None => {
                let r = (AVATAR_SIZE / 2) as i32;
                draw_filled_circle_mut(canvas, (AVATAR_X + r, AVATAR_Y + r), r, PLACEHOLDER);
            }
        }
    }

    /// Draw `owner / repo` on one line when it fits, otherwise `owner /`
    /// above `repo`.  Returns the y coordinate below the title.
    fn draw_title(&self, canvas: &mut RgbaImage, owner: &str, name: &str) -> i32 {
        let Some(font) = &self.font else {
            return TITLE_Y + 60;
        };
        let owner_scale = PxScale::from(48.0);
        let name_scale = PxScale::from(52.0);
        let max_width = (AVATAR_X - CONTENT_LEFT - CONTENT_RIGHT_MARGIN) as u32;

        let prefix = format!("{owner} / ");
        let prefix_width = text_size(owner_scale, font, &prefix).0;
        let name_width = text_size(name_scale, font, name).0;

        if prefix_width + name_width <= max_width {
            draw_text_mut(canvas, TEXT_MUTED, CONTENT_LEFT, TITLE_Y, owner_scale, font, &prefix);
            draw_text_mut(
                canvas,
                TEXT_PRIMARY,
                CONTENT_LEFT + prefix_width as i32,
                TITLE_Y - 2,
                name_scale,
                font,
                name,
            );
            return TITLE_Y + 60;
        }

        let owner_line = truncate_to_width(&format!("{owner} /"), max_width, |s| {
            text_size(owner_scale, font, s).0
        });
        draw_text_mut(canvas, TEXT_MUTED, CONTENT_LEFT, TITLE_Y, owner_scale, font, &owner_line);
        let name_line = truncate_to_width(name, max_width, |s| text_size(name_scale, font, s).0);
        draw_text_mut(canvas, TEXT_PRIMARY, CONTENT_LEFT, TITLE_Y + 58, name_scale, font, &name_line);
        TITLE_Y + 120
    }

    fn draw_description(&self, canvas: &mut RgbaImage, description: Option<&str>, title_end: i32) {
        let (Some(font), Some(text)) = (&self.font, description) else {
            return;
        };
        let scale = PxScale::from(24.0);
        let max_width = (WIDTH as i32 - CONTENT_LEFT - CONTENT_RIGHT_MARGIN) as u32;
        let mut y = (title_end + 10).max(AVATAR_Y + AVATAR_SIZE as i32 + 10);

        for line in wrap_text(text, max_width, DESCRIPTION_LINES, |s| text_size(scale, font, s).0) {
            draw_text_mut(canvas, TEXT_MUTED, CONTENT_LEFT, y, scale, font, &line);
            y += DESCRIPTION_LINE_HEIGHT;
        }
    }

    fn draw_stats(&self, canvas: &mut RgbaImage, content: &CardContent) {
        let stats = [
            (content.contributors, "Contributors", Icon::Contributors),
            (content.issues, "Issues+PRs", Icon::Issue),
            (content.forks, "Forks", Icon::Fork),
            (content.stars, "Stars", Icon::Star),
        ];
        let section_width = (WIDTH as i32 - CONTENT_LEFT * 2) / stats.len() as i32;
        let number_scale = PxScale::from(26.0);
        let label_scale = PxScale::from(15.0);

        for (i, (count, label, icon)) in stats.into_iter().enumerate() {
            let x = CONTENT_LEFT + i as i32 * section_width;
            draw_icon(canvas, icon, x, STATS_Y + 8);

            if let Some(font) = &self.font {
                let number = format_number(count);
                let number_x = x + ICON_SIZE + 10;
                // Drawn twice, one pixel apart, for a bolder look.
                for dx in [0, 1] {
                    draw_text_mut(canvas, TEXT_PRIMARY, number_x + dx, STATS_Y, number_scale, font, &number);
                }
                draw_text_mut(canvas, TEXT_MUTED, x, STATS_Y + 36, label_scale, font, label);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

fn draw_color_bar(canvas: &mut RgbaImage) {
    let segment = WIDTH / BAR_COLORS.len() as u32;
    for (i, color) in BAR_COLORS.iter().enumerate() {
        let x = i as u32 * segment;
        let width = if i == BAR_COLORS.len() - 1 { WIDTH - x } else { segment };
        let rect = Rect::at(x as i32, (HEIGHT - COLOR_BAR_HEIGHT) as i32).of_size(width, COLOR_BAR_HEIGHT);
        draw_filled_rect_mut(canvas, rect, *color);
    }
}

fn draw_icon(canvas: &mut RgbaImage, icon: Icon, x: i32, y: i32) {
    let s = ICON_SIZE;
    match icon {
        Icon::Contributors => {
            draw_filled_circle_mut(canvas, (x + 5, y + 4), 4, ICON);
            draw_filled_circle_mut(canvas, (x + 15, y + 4), 4, ICON);
            draw_filled_circle_mut(canvas, (x + 5, y + 15), 5, ICON);
            draw_filled_circle_mut(canvas, (x + 15, y + 15), 5, ICON);
        }
        Icon::Issue => {
            let c = (x + s / 2, y + s / 2);
            draw_hollow_circle_mut(canvas, c, s / 2, ICON);
            draw_hollow_circle_mut(canvas, c, s / 2 - 1, ICON);
            draw_filled_circle_mut(canvas, c, 2, ICON);
        }
        Icon::Fork => {
            let (fx, fy, fs) = (x as f32, y as f32, s as f32);
            let trunk_top = (fx + fs / 2.0, fy + 2.0);
            let split = (fx + fs / 2.0, fy + fs / 3.0);
            let left = (fx + fs / 4.0, fy + fs * 2.0 / 3.0);
            let right = (fx + fs * 3.0 / 4.0, fy + fs * 2.0 / 3.0);
            for dx in [0.0, 1.0] {
                draw_line_segment_mut(canvas, (trunk_top.0 + dx, trunk_top.1), (split.0 + dx, fy + fs - 2.0), ICON);
                draw_line_segment_mut(canvas, (split.0 + dx, split.1), (left.0 + dx, left.1), ICON);
                draw_line_segment_mut(canvas, (split.0 + dx, split.1), (right.0 + dx, right.1), ICON);
            }
            draw_filled_circle_mut(canvas, (left.0 as i32, left.1 as i32), 2, ICON);
            draw_filled_circle_mut(canvas, (right.0 as i32, right.1 as i32), 2, ICON);
            draw_filled_circle_mut(canvas, (trunk_top.0 as i32, trunk_top.1 as i32), 2, ICON);
        }
        Icon::Star => {
            let points = star_points(x as f32 + s as f32 / 2.0, y as f32 + s as f32 / 2.0, s as f32 / 2.0);
            draw_polygon_mut(canvas, &points, ICON);
        }
    }
}

/// Vertices of a five-pointed star, alternating outer and inner radius.
fn star_points(cx: f32, cy: f32, outer: f32) -> Vec<Point<i32>> {
    let inner = outer / 2.0;
    (0..10)
        .map(|i| {
            let angle = std::f32::consts::PI / 5.0 * i as f32 - std::f32::consts::FRAC_PI_2;
            let r = if i % 2 == 0 { outer } else { inner };
            Point::new((cx + r * angle.cos()).round() as i32, (cy + r * angle.sin()).round() as i32)
        })
        .collect()
}

/// Make everything outside the inscribed circle transparent.
fn mask_circle(img: &mut RgbaImage) {
    let r = img.width() as f32 / 2.0;
    for (x, y, px) in img.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - r;
        let dy = y as f32 + 0.5 - r;
        let dist = (dx * dx + dy * dy).sqrt();
        if dist > r {
            px.0[3] = 0;
        } else if dist > r - 1.0 {
            // One-pixel soft edge.
            px.0[3] = (f32::from(px.0[3]) * (r - dist)) as u8;
        }
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Compact number formatting: `999`, `1.2k`, `3.4M`.
pub fn format_number(n: u64) -> String {
    fn scaled(n: u64, unit: f64, suffix: &str) -> String {
        let s = format!("{:.1}", n as f64 / unit);
        format!("{}{suffix}", s.strip_suffix(".0").unwrap_or(&s))
    }
    match n {
        0..=999 => n.to_string(),
        1_000..=999_949 => scaled(n, 1_000.0, "k"),
        _ => scaled(n, 1_000_000.0, "M"),
    }
}

/// Shorten `text` with a trailing ellipsis until `measure` says it fits.
fn truncate_to_width(text: &str, max_width: u32, measure: impl Fn(&str) -> u32) -> String {
    if measure(text) <= max_width {
        return text.to_string();
    }
    let mut chars: Vec<char> = text.chars().collect();
    while !chars.is_empty() {
        chars.pop();
        let candidate = format!("{}…", chars.iter().collect::<String>().trim_end());
        if measure(&candidate) <= max_width {
            return candidate;
        }
    }
    "…".to_string()
}

/// Greedy line wrapping on whitespace, splitting words that are wider than a
/// whole line (e.g. CJK runs).  Text that does not fit in `max_lines` ends
/// with an ellipsis on the last line.
pub fn wrap_text(text: &str, max_width: u32, max_lines: usize, measure: impl Fn(&str) -> u32) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    let mut tokens: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        if measure(word) <= max_width {
            tokens.push(word.to_string());
            continue;
        }
        let mut piece = String::new();
        for ch in word.chars() {
            piece.push(ch);
            if measure(&piece) > max_width {
                piece.pop();
                tokens.push(std::mem::take(&mut piece));
                piece.push(ch);
            }
        }
        if !piece.is_empty() {
            tokens.push(piece);
        }
    }

    let mut overflow = false;
    for token in tokens {
        let candidate = if current.is_empty() {
            token.clone()
        } else {
            format!("{current} {token}")
        };
        if measure(&candidate) <= max_width {
            current = candidate;
            continue;
        }
        lines.push(std::mem::take(&mut current));
        if lines.len() == max_lines {
            overflow = true;
            break;
        }
        current = token;
    }
    if !overflow && !current.is_empty() {
        lines.push(current);
    }

    if overflow && let Some(last) = lines.last_mut() {
        *last = truncate_to_width(&format!("{last}…"), max_width, &measure);
        if !last.ends_with('…') {
            last.push('…');
        }
    }
    lines
}
