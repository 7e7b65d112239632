//! Pure pixel routines for the customization pipeline: placing a design
//! onto a garment canvas before provider stylization, and recovering the
//! garment's true base color from a provider-shifted render.

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

/// Print-area placement, proportional to the garment canvas.
const RECT_X_RATIO: f32 = 0.22;
const RECT_Y_RATIO: f32 = 0.28;
const RECT_W_RATIO: f32 = 0.56;
const RECT_H_RATIO: f32 = 0.44;

/// A design fills at most this share of the placement rectangle.
const FIT_RATIO: f32 = 0.9;

/// Chroma-key thresholds: RGB distance to the estimated background color.
/// At or below the lower bound a pixel is unchanged garment; at or above
/// the upper bound it is new print.
const MASK_LOWER: f32 = 18.0;
const MASK_UPPER: f32 = 55.0;

/// Background samples sit this far inside the crop, as a share of its
/// shorter dimension.
const SAMPLE_INSET_RATIO: f32 = 0.06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("empty input image")]
    EmptyInput,
}

/// The proportional print area of a `canvas_width` x `canvas_height`
/// garment photo, clamped to the canvas bounds.
pub fn placement_rect(canvas_width: u32, canvas_height: u32) -> PlacementRect {
    let x = ((canvas_width as f32 * RECT_X_RATIO) as u32).min(canvas_width.saturating_sub(1));
    let y = ((canvas_height as f32 * RECT_Y_RATIO) as u32).min(canvas_height.saturating_sub(1));
    let width = ((canvas_width as f32 * RECT_W_RATIO) as u32)
        .min(canvas_width - x)
        .max(1);
    let height = ((canvas_height as f32 * RECT_H_RATIO) as u32)
        .min(canvas_height - y)
        .max(1);
    PlacementRect {
        x,
        y,
        width,
        height,
    }
}

/// Scale factor that fits a `width` x `height` design into the fit box of
/// `rect`, preserving aspect ratio. Never upscales.
fn fit_scale(width: u32, height: u32, rect: PlacementRect) -> f32 {
    let max_width = rect.width as f32 * FIT_RATIO;
    let max_height = rect.height as f32 * FIT_RATIO;
    (max_width / width as f32)
        .min(max_height / height as f32)
        .min(1.0)
}

/// Draw `design` centered in the print area of `garment`.
///
/// Output dimensions always equal the garment's. The design is scaled to
/// fit the placement rectangle but never enlarged, so the exact design
/// pixels are anchored before the provider stylizes the composite.
pub fn compose_design_onto_garment(
    garment: &[u8],
    design: &[u8],
) -> Result<Vec<u8>, CompositorError> {
    if garment.is_empty() || design.is_empty() {
        return Err(CompositorError::EmptyInput);
    }

    let mut canvas = image::load_from_memory(garment)?.to_rgba8();
    let design_img = image::load_from_memory(design)?.to_rgba8();

    let rect = placement_rect(canvas.width(), canvas.height());
    let scale = fit_scale(design_img.width(), design_img.height(), rect);

    let scaled = if scale < 1.0 {
        let width = ((design_img.width() as f32 * scale).round() as u32)
            .clamp(1, rect.width);
        let height = ((design_img.height() as f32 * scale).round() as u32)
            .clamp(1, rect.height);
        imageops::resize(&design_img, width, height, FilterType::Lanczos3)
    } else {
        design_img
    };

    let x = rect.x + (rect.width - scaled.width()) / 2;
    let y = rect.y + (rect.height - scaled.height()) / 2;
    imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));

    encode_png(&canvas)
}

/// Recover the original garment's base color while keeping the provider's
/// generated print.
///
/// Crops the print area out of `generated`, masks it by chroma distance to
/// the locally estimated background color, and draws the masked crop back
/// over a copy of `original`. Returns `None` for empty inputs.
pub fn recover_original_color(
    original: &[u8],
    generated: &[u8],
) -> Result<Option<Vec<u8>>, CompositorError> {
    if original.is_empty() || generated.is_empty() {
        return Ok(None);
    }

    let original_img = image::load_from_memory(original)?.to_rgba8();
    let mut generated_img = image::load_from_memory(generated)?.to_rgba8();

    let (width, height) = original_img.dimensions();
    if generated_img.dimensions() != (width, height) {
        generated_img = imageops::resize(&generated_img, width, height, FilterType::Lanczos3);
    }

    let rect = placement_rect(width, height);
    let mut crop =
        imageops::crop_imm(&generated_img, rect.x, rect.y, rect.width, rect.height).to_image();

    let background = estimate_background_color(&crop);
    for pixel in crop.pixels_mut() {
        let distance = color_distance(*pixel, background);
        pixel[3] = alpha_for_distance(distance);
    }

    let mut output = original_img;
    imageops::overlay(&mut output, &crop, i64::from(rect.x), i64::from(rect.y));

    Ok(Some(encode_png(&output)?))
}

/// Average RGB of six samples: the four corners and the top/bottom edge
/// midpoints, each inset from the crop border.
fn estimate_background_color(crop: &RgbaImage) -> [f32; 3] {
    let (width, height) = crop.dimensions();
    let inset = ((width.min(height) as f32 * SAMPLE_INSET_RATIO).round() as u32)
        .min(width.saturating_sub(1) / 2)
        .min(height.saturating_sub(1) / 2);

    let left = inset;
    let right = width - 1 - inset;
    let top = inset;
    let bottom = height - 1 - inset;
    let mid_x = width / 2;

    let samples = [
        (left, top),
        (right, top),
        (left, bottom),
        (right, bottom),
        (mid_x, top),
        (mid_x, bottom),
    ];

    let mut sum = [0.0f32; 3];
    for (x, y) in samples {
        let pixel = crop.get_pixel(x, y);
        sum[0] += f32::from(pixel[0]);
        sum[1] += f32::from(pixel[1]);
        sum[2] += f32::from(pixel[2]);
    }
    [
        sum[0] / samples.len() as f32,
        sum[1] / samples.len() as f32,
        sum[2] / samples.len() as f32,
    ]
}

fn color_distance(pixel: Rgba<u8>, background: [f32; 3]) -> f32 {
    let dr = f32::from(pixel[0]) - background[0];
    let dg = f32::from(pixel[1]) - background[1];
    let db = f32::from(pixel[2]) - background[2];
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Chroma-key alpha: 0 at or below the lower threshold, 255 at or above
/// the upper, linear in between.
fn alpha_for_distance(distance: f32) -> u8 {
    if distance <= MASK_LOWER {
        0
    } else if distance >= MASK_UPPER {
        255
    } else {
        (255.0 * (distance - MASK_LOWER) / (MASK_UPPER - MASK_LOWER)).round() as u8
    }
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, CompositorError> {
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
