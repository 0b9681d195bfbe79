//! Diagnostic overlay and composite drawing on RGB buffers.

use anyhow::{Result, anyhow};
use chrono::{Local, TimeZone};
use image::{GrayImage, Rgb, RgbImage};
use video_ingest::Frame;

use crate::vision::data::{ControllerOutput, Diagnostics, Mode};

pub(crate) const COOLDOWN_BLUE: Rgb<u8> = Rgb([0, 128, 255]);
pub(crate) const DETECTING_YELLOW: Rgb<u8> = Rgb([255, 210, 0]);
pub(crate) const TRACKING_GREEN: Rgb<u8> = Rgb([0, 230, 0]);
pub(crate) const CROSSING_RED: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_MAGENTA: Rgb<u8> = Rgb([255, 0, 255]);
const BAND_GREY: Rgb<u8> = Rgb([150, 150, 150]);
const LIMIT_CYAN: Rgb<u8> = Rgb([0, 220, 220]);
const TEXT_BACKING: Rgb<u8> = Rgb([0, 0, 0]);

const BORDER_PX: i32 = 3;
const SEPARATOR_PX: u32 = 2;

pub(crate) fn mode_color(mode: Mode) -> Rgb<u8> {
    match mode {
        Mode::CoolDown => COOLDOWN_BLUE,
        Mode::Detecting => DETECTING_YELLOW,
        Mode::Tracking => TRACKING_GREEN,
    }
}

pub(crate) fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    if !frame.is_consistent() {
        return Err(anyhow!(
            "frame buffer of {} bytes does not match {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        ));
    }
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    RgbImage::from_raw(frame.width as u32, frame.height as u32, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

/// Draw mode border, line, bands, tracked box and status text.
pub(crate) fn annotate_output(output: &ControllerOutput) -> Result<RgbImage> {
    let mut image = frame_to_rgb(&output.frame)?;
    let (width, height) = (image.width() as i32, image.height() as i32);
    let color = mode_color(output.mode);
    let params = &output.params;

    for inset in 0..BORDER_PX {
        draw_rectangle(
            &mut image,
            inset,
            inset,
            width - 1 - inset,
            height - 1 - inset,
            color,
        );
    }

    let line_x = params.line_x as i32;
    let band = (params.band * width as f32).round() as i32;
    let y_lo = (params.min_y_pct as f32 / 100.0 * height as f32).round() as i32;
    let y_hi = (params.max_y_pct as f32 / 100.0 * height as f32).round() as i32;
    draw_vertical(&mut image, line_x - band, y_lo, y_hi, BAND_GREY);
    draw_vertical(&mut image, line_x + band, y_lo, y_hi, BAND_GREY);
    draw_horizontal(&mut image, 0, width - 1, y_lo, LIMIT_CYAN);
    draw_horizontal(&mut image, 0, width - 1, y_hi - 1, LIMIT_CYAN);
    fill_rect(&mut image, line_x, 0, line_x + 1, height - 1, LINE_MAGENTA);

    if let Some(bbox) = output.bbox {
        draw_rectangle(
            &mut image,
            bbox.x as i32,
            bbox.y as i32,
            bbox.right() as i32 - 1,
            bbox.bottom() as i32 - 1,
            color,
        );
    }

    let captured = Local
        .timestamp_millis_opt(output.frame.timestamp_ms)
        .single()
        .map(|ts| ts.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_default();
    let lines = [
        format!(
            "MODE {} {:.1}S",
            output.mode.label(),
            output.mode_elapsed.as_secs_f32()
        ),
        format!("FPS {:4.1}", output.fps),
        format!("TRACKER {}", output.tracker),
        format!("LINE X={}", params.line_x),
        format!("FRAME {:06} {captured}", output.frame_number),
    ];
    for (row, text) in lines.iter().enumerate() {
        let y = BORDER_PX + 3 + row as i32 * 10;
        text_with_backing(&mut image, BORDER_PX + 3, y, text, color);
    }

    if let Some(crossing) = &output.crossing {
        let text = format!("CROSSING {}", crossing.direction.label());
        let text_width = text.chars().count() as i32 * 6;
        let x = ((width - text_width) / 2).max(0);
        let y = (height - BORDER_PX - 14).max(0);
        fill_rect(&mut image, x - 4, y - 3, x + text_width + 3, y + 9, CROSSING_RED);
        draw_label(&mut image, x, y, &text, Rgb([255, 255, 255]));
    }

    Ok(image)
}

/// Background, sub-frame, mask and edge map stacked top to bottom with red
/// separators; every panel marks the detection line.
pub(crate) fn build_composite(diagnostics: &Diagnostics) -> RgbImage {
    let panels: [(&GrayImage, &str); 4] = [
        (&diagnostics.background, "BACKGROUND"),
        (&diagnostics.subframe, "FRAME"),
        (&diagnostics.mask, "MASK"),
        (&diagnostics.edges, "EDGES"),
    ];
    let (width, height) = diagnostics.subframe.dimensions();
    let total_height = height * 4 + SEPARATOR_PX * 3;
    let mut composite = RgbImage::new(width, total_height);

    for (index, (panel, label)) in panels.into_iter().enumerate() {
        let top = index as u32 * (height + SEPARATOR_PX);
        if index > 0 {
            let sep_top = top as i32 - SEPARATOR_PX as i32;
            fill_rect(
                &mut composite,
                0,
                sep_top,
                width as i32 - 1,
                top as i32 - 1,
                CROSSING_RED,
            );
        }
        for (x, y, pixel) in panel.enumerate_pixels() {
            if x < width && y < height {
                let v = pixel[0];
                composite.put_pixel(x, top + y, Rgb([v, v, v]));
            }
        }
        draw_vertical(
            &mut composite,
            diagnostics.line_x as i32,
            top as i32,
            (top + height) as i32 - 1,
            LINE_MAGENTA,
        );
        draw_label(&mut composite, 2, top as i32 + 2, label, DETECTING_YELLOW);
    }
    composite
}

fn text_with_backing(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let text_width = text.chars().count() as i32 * 6;
    fill_rect(image, x - 2, y - 1, x + text_width, y + 7, TEXT_BACKING);
    draw_label(image, x, y, text, color);
}

fn draw_vertical(image: &mut RgbImage, x: i32, top: i32, bottom: i32, color: Rgb<u8>) {
    if x < 0 || x >= image.width() as i32 {
        return;
    }
    let bottom = bottom.min(image.height() as i32 - 1);
    for y in top.max(0)..=bottom {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_horizontal(image: &mut RgbImage, left: i32, right: i32, y: i32, color: Rgb<u8>) {
    if y < 0 || y >= image.height() as i32 {
        return;
    }
    let right = right.min(image.width() as i32 - 1);
    for x in left.max(0)..=right {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    draw_horizontal(image, left, right, top, color);
    draw_horizontal(image, left, right, bottom, color);
    draw_vertical(image, left, top, bottom, color);
    draw_vertical(image, right, top, bottom, color);
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// 5x7 bitmap text; unknown characters advance without drawing.
fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '=' => [0, 0, 0b11111, 0, 0b11111, 0, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Local;
    use motion_core::BoundingBox;
    use video_ingest::FrameFormat;

    use super::*;
    use crate::vision::data::{CrossingDetection, CrossingDirection, RuntimeParameters};

    fn output(mode: Mode, crossing: bool) -> ControllerOutput {
        let frame = Arc::new(Frame {
            data: vec![30; 320 * 240 * 3],
            width: 320,
            height: 240,
            timestamp_ms: 1_700_000_000_000,
            format: FrameFormat::Bgr8,
        });
        ControllerOutput {
            frame: frame.clone(),
            frame_number: 42,
            fps: 24.5,
            mode,
            mode_elapsed: Duration::from_millis(1_500),
            bbox: BoundingBox::new(100, 80, 40, 30),
            params: RuntimeParameters {
                line_x: 160,
                min_y_pct: 10,
                max_y_pct: 90,
                band: 0.1,
                min_area: 0.003,
                tracker: "CSRT".into(),
            },
            tracker: "CSRT",
            crossing: crossing.then(|| CrossingDetection {
                direction: CrossingDirection::Right,
                timestamp: Local::now(),
                previous: frame,
            }),
            diagnostics: None,
        }
    }

    #[test]
    fn frame_channels_are_swapped_to_rgb() {
        let frame = Frame {
            data: vec![1, 2, 3, 4, 5, 6],
            width: 2,
            height: 1,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let rgb = frame_to_rgb(&frame).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([3, 2, 1]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([6, 5, 4]));
    }

    #[test]
    fn overlay_uses_mode_colour_and_marks_line() {
        let image = annotate_output(&output(Mode::Tracking, false)).unwrap();
        assert_eq!(image.dimensions(), (320, 240));
        assert_eq!(image.get_pixel(0, 120), &TRACKING_GREEN);
        assert_eq!(image.get_pixel(160, 120), &LINE_MAGENTA);
        assert_eq!(image.get_pixel(100, 100), &TRACKING_GREEN);

        let image = annotate_output(&output(Mode::CoolDown, false)).unwrap();
        assert_eq!(image.get_pixel(319, 120), &COOLDOWN_BLUE);
    }

    #[test]
    fn crossing_frame_gets_a_banner() {
        let image = annotate_output(&output(Mode::Tracking, true)).unwrap();
        let banner_row = 240 - 3 - 14 - 2;
        assert!(
            (0..320).any(|x| image.get_pixel(x, banner_row) == &CROSSING_RED),
            "no banner on row {banner_row}"
        );
    }

    #[test]
    fn composite_stacks_four_panels_with_separators() {
        let mut subframe = GrayImage::new(40, 20);
        subframe.put_pixel(5, 15, image::Luma([200]));
        let diagnostics = Diagnostics {
            background: GrayImage::from_pixel(40, 20, image::Luma([90])),
            subframe,
            mask: GrayImage::from_pixel(40, 20, image::Luma([255])),
            edges: GrayImage::new(40, 20),
            line_x: 30,
        };
        let composite = build_composite(&diagnostics);
        assert_eq!(composite.dimensions(), (40, 20 * 4 + 6));
        assert_eq!(composite.get_pixel(10, 20), &CROSSING_RED);
        assert_eq!(composite.get_pixel(10, 21), &CROSSING_RED);
        assert_eq!(composite.get_pixel(20, 15), &Rgb([90, 90, 90]));
        assert_eq!(composite.get_pixel(5, 22 + 15), &Rgb([200, 200, 200]));
        assert_eq!(composite.get_pixel(20, 44 + 15), &Rgb([255, 255, 255]));
        for panel in 0..4 {
            assert_eq!(composite.get_pixel(30, panel * 22 + 10), &LINE_MAGENTA);
        }
    }
}
