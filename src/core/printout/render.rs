//! Diff and comparison images

use super::{Printout, PrintoutError, BLACK};
use image::{GrayImage, Rgb, RgbImage};

const WHITE_RGB: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK_RGB: Rgb<u8> = Rgb([0, 0, 0]);
const ADDED_RGB: Rgb<u8> = Rgb([0, 200, 0]);
const REMOVED_RGB: Rgb<u8> = Rgb([255, 0, 0]);

/// Height of the label band above each panel
const LABEL_BAND: u32 = 20;
const LABEL_SCALE: u32 = 2;

/// Colour the dots that changed from `old` to `new`
///
/// Both printouts are saturated and cropped first. Dots burned in both are
/// black, dots only in `new` are green, dots only in `old` are red. The image
/// is as long as the longer of the two uncropped printouts.
pub fn diff_image(old: &Printout, new: &Printout) -> Result<RgbImage, PrintoutError> {
    if old.width() != new.width() {
        return Err(PrintoutError::WidthMismatch {
            left: old.width(),
            right: new.width(),
        });
    }

    let height = old.length().max(new.length());
    let old = old.saturated().cropped();
    let new = new.saturated().cropped();
    let overlap = old.length().min(new.length());

    let mut diff = RgbImage::from_pixel(old.width(), height, WHITE_RGB);
    for y in 0..overlap {
        for x in 0..old.width() {
            let was = old.image().get_pixel(x, y).0[0] == BLACK;
            let is = new.image().get_pixel(x, y).0[0] == BLACK;
            let colour = match (was, is) {
                (true, true) => BLACK_RGB,
                (false, true) => ADDED_RGB,
                (true, false) => REMOVED_RGB,
                (false, false) => continue,
            };
            diff.put_pixel(x, y, colour);
        }
    }
    Ok(diff)
}

/// Side-by-side image of `old`, `new` and their diff, each under a label
pub fn comparison_image(
    old: &Printout,
    new: &Printout,
    old_label: &str,
    new_label: &str,
) -> Result<RgbImage, PrintoutError> {
    let diff = diff_image(old, new)?;
    let width = old.width();
    let height = diff.height() + LABEL_BAND;

    let mut canvas = RgbImage::from_pixel(width * 3, height, WHITE_RGB);
    paste_gray(&mut canvas, old.image(), 0, LABEL_BAND);
    paste_gray(&mut canvas, new.image(), width, LABEL_BAND);
    image::imageops::replace(&mut canvas, &diff, i64::from(width) * 2, i64::from(LABEL_BAND));

    draw_label(&mut canvas, old_label, 2);
    draw_label(&mut canvas, new_label, width + 2);
    draw_label(&mut canvas, "DIFF", width * 2 + 2);

    Ok(canvas)
}

fn paste_gray(canvas: &mut RgbImage, image: &GrayImage, left: u32, top: u32) {
    for (x, y, pixel) in image.enumerate_pixels() {
        let v = pixel.0[0];
        canvas.put_pixel(left + x, top + y, Rgb([v, v, v]));
    }
}

/// 3x5 glyphs for label text, one row per entry, MSB is the left column
fn glyph(c: char) -> Option<[u8; 5]> {
    let rows = match c {
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        _ => return None,
    };
    Some(rows)
}

fn draw_label(canvas: &mut RgbImage, text: &str, left: u32) {
    let top = (LABEL_BAND - 5 * LABEL_SCALE) / 2;
    let advance = 4 * LABEL_SCALE;

    for (i, c) in text.to_ascii_uppercase().chars().enumerate() {
        let Some(rows) = glyph(c) else { continue };
        let origin = left + i as u32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..LABEL_SCALE {
                    for dx in 0..LABEL_SCALE {
                        let x = origin + col * LABEL_SCALE + dx;
                        let y = top + row as u32 * LABEL_SCALE + dy;
                        if x < canvas.width() && y < canvas.height() {
                            canvas.put_pixel(x, y, BLACK_RGB);
                        }
                    }
                }
            }
        }
    }
}
