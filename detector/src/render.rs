//! Drawing detections onto the overlay surface.
//!
use std::{io, path::Path, path::PathBuf};

use common::{BBox, Detection, DisplaySize};
use image::{
    codecs::jpeg::JpegEncoder, imageops, imageops::FilterType, ColorType, DynamicImage,
    ImageError, Rgba, RgbImage, RgbaImage,
};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};
use thiserror::Error;

pub const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 255, 255]);
pub const TEXT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);
pub const LINE_WIDTH: u32 = 4;
/// Font size in pixels, also used as the text height.
pub const FONT_SIZE: f32 = 16.0;
pub const LABEL_PADDING: f32 = 4.0;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to read font {path}: {source}")]
    FontIo { path: PathBuf, source: io::Error },
    #[error("{path} is not a usable font")]
    Font { path: PathBuf },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] ImageError),
}

/// 2D drawing target of the detection overlay.
pub trait Surface {
    fn size(&self) -> (u32, u32);

    /// Reset every pixel to transparent.
    fn clear(&mut self);

    fn stroke_rect(&mut self, rect: &BBox, color: Rgba<u8>, line_width: u32);

    fn fill_rect(&mut self, rect: &BBox, color: Rgba<u8>);

    /// Width of `text` in pixels.
    fn measure_text(&self, text: &str) -> f32;

    /// Draw `text` with its top-left corner at `(x, y)`.
    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Rgba<u8>);

    /// Pixels of the surface, if it is backed by a raster.
    fn overlay(&self) -> Option<&RgbaImage> {
        None
    }
}

/// Transparent RGBA raster with rectangle primitives.
#[derive(Clone, Debug, PartialEq)]
pub struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    pub fn new(display: DisplaySize) -> Self {
        Self {
            image: RgbaImage::new(display.width, display.height),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn clear(&mut self) {
        self.image.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
    }

    /// Outline centred on the rectangle edges, like a canvas stroke.
    pub fn stroke_rect(&mut self, rect: &BBox, color: Rgba<u8>, line_width: u32) {
        let half = (line_width / 2) as f32;
        for i in 0..line_width {
            let grow = half - i as f32;
            let ring = BBox {
                x: rect.x - grow,
                y: rect.y - grow,
                width: rect.width + 2.0 * grow,
                height: rect.height + 2.0 * grow,
            };
            if let Some(ring) = pixel_rect(&ring, self.image.dimensions()) {
                draw_hollow_rect_mut(&mut self.image, ring, color);
            }
        }
    }

    pub fn fill_rect(&mut self, rect: &BBox, color: Rgba<u8>) {
        if let Some(rect) = pixel_rect(rect, self.image.dimensions()) {
            draw_filled_rect_mut(&mut self.image, rect, color);
        }
    }
}

/// Pixel rectangle of `rect`, clipped to one pixel outside `bounds` so that
/// edges beyond the canvas stay invisible. Rectangles with a non-finite
/// coordinate, or narrower or shorter than one pixel, are not drawn.
fn pixel_rect(rect: &BBox, bounds: (u32, u32)) -> Option<Rect> {
    if ![rect.x, rect.y, rect.width, rect.height]
        .iter()
        .all(|v| v.is_finite())
    {
        return None;
    }
    let (width, height) = (rect.width.round(), rect.height.round());
    if width < 1.0 || height < 1.0 {
        return None;
    }

    let clip = |start: f32, len: f32, limit: u32| {
        let start = start.round();
        let limit = limit as f32 + 1.0;
        (start.clamp(-1.0, limit), (start + len).clamp(-1.0, limit))
    };
    let (left, right) = clip(rect.x, width, bounds.0);
    let (top, bottom) = clip(rect.y, height, bounds.1);
    if right - left < 1.0 || bottom - top < 1.0 {
        return None;
    }

    let origin = Rect::at(left as i32, top as i32);
    Some(origin.of_size((right - left) as u32, (bottom - top) as u32))
}

/// Text origins stay far enough inside the `i32` range for glyph offsets.
const TEXT_COORD_LIMIT: f32 = (1 << 20) as f32;

/// Canvas with a TrueType font for captions.
pub struct RasterSurface {
    canvas: Canvas,
    font: Font<'static>,
}

impl RasterSurface {
    pub fn new(display: DisplaySize, font: Font<'static>) -> Self {
        Self {
            canvas: Canvas::new(display),
            font,
        }
    }

    fn scale() -> Scale {
        Scale::uniform(FONT_SIZE)
    }
}

impl Surface for RasterSurface {
    fn size(&self) -> (u32, u32) {
        self.canvas.image.dimensions()
    }

    fn clear(&mut self) {
        self.canvas.clear();
    }

    fn stroke_rect(&mut self, rect: &BBox, color: Rgba<u8>, line_width: u32) {
        self.canvas.stroke_rect(rect, color, line_width);
    }

    fn fill_rect(&mut self, rect: &BBox, color: Rgba<u8>) {
        self.canvas.fill_rect(rect, color);
    }

    fn measure_text(&self, text: &str) -> f32 {
        let (width, _height) = text_size(Self::scale(), &self.font, text);
        width as f32
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Rgba<u8>) {
        if !x.is_finite() || !y.is_finite() {
            return;
        }
        let coord = |v: f32| v.round().clamp(-TEXT_COORD_LIMIT, TEXT_COORD_LIMIT) as i32;
        draw_text_mut(
            &mut self.canvas.image,
            color,
            coord(x),
            coord(y),
            Self::scale(),
            &self.font,
            text,
        );
    }

    fn overlay(&self) -> Option<&RgbaImage> {
        Some(self.canvas.image())
    }
}

pub fn load_font(path: &Path) -> Result<Font<'static>, RenderError> {
    let data = std::fs::read(path).map_err(|source| RenderError::FontIo {
        path: path.to_path_buf(),
        source,
    })?;

    Font::try_from_vec(data).ok_or_else(|| RenderError::Font {
        path: path.to_path_buf(),
    })
}

/// Clear the surface and draw all detections.
///
/// Drawing happens in three passes over the detections, in order: box
/// outlines, label backgrounds, caption text. No caption is covered by a
/// later box or background.
pub fn render_detections<S: Surface + ?Sized>(surface: &mut S, detections: &[Detection]) {
    surface.clear();

    for detection in detections {
        surface.stroke_rect(&detection.bbox, BOX_COLOR, LINE_WIDTH);
    }

    let captions: Vec<String> = detections.iter().map(Detection::caption).collect();

    for (detection, caption) in detections.iter().zip(&captions) {
        let background = BBox {
            x: detection.bbox.x,
            y: detection.bbox.y,
            width: surface.measure_text(caption) + LABEL_PADDING,
            height: FONT_SIZE + LABEL_PADDING,
        };
        surface.fill_rect(&background, BOX_COLOR);
    }

    for (detection, caption) in detections.iter().zip(&captions) {
        surface.fill_text(caption, detection.bbox.x, detection.bbox.y, TEXT_COLOR);
    }
}

/// Scale the frame to the display and lay the overlay on top.
pub fn compose_frame(
    frame: &RgbImage,
    overlay: Option<&RgbaImage>,
    display: DisplaySize,
) -> RgbImage {
    let resized = imageops::resize(frame, display.width, display.height, FilterType::Triangle);
    let Some(overlay) = overlay else {
        return resized;
    };

    let mut composed = DynamicImage::ImageRgb8(resized).into_rgba8();
    imageops::overlay(&mut composed, overlay, 0, 0);
    DynamicImage::ImageRgba8(composed).into_rgb8()
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, RenderError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame.as_raw(),
        frame.width(),
        frame.height(),
        ColorType::Rgb8,
    )?;
    Ok(buf)
}
