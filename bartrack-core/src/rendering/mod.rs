//! rendering — fixed-size render surface + tracking overlays
//!
//! Each tick copies the incoming frame into one reusable buffer of the
//! configured surface size; both inference services read that buffer and
//! the overlays are drawn onto it afterwards.

use anyhow::{ensure, Context, Result};
use fast_image_resize as fr;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use tracing::warn;

use crate::pose::Keypoint;
use crate::tracking::BoundingBox;
use crate::video::RgbFrame;

/// Reusable drawing surface; its size never changes after construction.
pub struct RenderSurface {
    frame: RgbFrame,
    resizer: fr::Resizer,
}

impl RenderSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frame: RgbFrame::black(width, height),
            resizer: fr::Resizer::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    /// Current surface contents (frame plus any overlays drawn this tick).
    pub fn frame(&self) -> &RgbFrame {
        &self.frame
    }

    /// Copy `src` into the surface, scaling when the sizes differ.
    pub fn capture(&mut self, src: &RgbFrame) -> Result<()> {
        ensure!(
            src.data.len() == src.width as usize * src.height as usize * 3,
            "source frame buffer does not match {}x{}",
            src.width,
            src.height
        );
        self.frame.pts_ms = src.pts_ms;

        if src.width == self.frame.width && src.height == self.frame.height {
            self.frame.data.copy_from_slice(&src.data);
            return Ok(());
        }

        let source = fr::images::ImageRef::new(src.width, src.height, &src.data, fr::PixelType::U8x3)
            .context("failed to create surface resize source")?;

        let expected = self.frame.width as usize * self.frame.height as usize * 3;
        self.frame.data.resize(expected, 0);
        let mut dst = fr::images::Image::from_vec_u8(
            self.frame.width,
            self.frame.height,
            std::mem::take(&mut self.frame.data),
            fr::PixelType::U8x3,
        )
        .context("failed to create surface resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        let resized = self.resizer.resize(&source, &mut dst, Some(&options));
        self.frame.data = dst.into_vec();
        resized.context("surface resize failed")
    }

    /// Stroke `bbox` with a `line_width`-pixel border drawn inwards.
    pub fn draw_box(&mut self, bbox: &BoundingBox, color: [u8; 3], line_width: u32) {
        let x = bbox.x.round() as i32;
        let y = bbox.y.round() as i32;
        let w = bbox.width.round() as i64;
        let h = bbox.height.round() as i64;
        self.with_image(|img| {
            for t in 0..line_width.max(1) as i64 {
                let (iw, ih) = (w - 2 * t, h - 2 * t);
                if iw < 1 || ih < 1 {
                    break;
                }
                let rect = Rect::at(x + t as i32, y + t as i32).of_size(iw as u32, ih as u32);
                draw_hollow_rect_mut(img, rect, Rgb(color));
            }
        });
    }

    /// Connect `points` in order.
    pub fn draw_polyline(&mut self, points: &[Keypoint], color: [u8; 3], line_width: u32) {
        self.with_image(|img| {
            for pair in points.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                for d in 0..line_width.max(1) {
                    let d = d as f32;
                    draw_line_segment_mut(img, (a.x + d, a.y), (b.x + d, b.y), Rgb(color));
                    draw_line_segment_mut(img, (a.x, a.y + d), (b.x, b.y + d), Rgb(color));
                }
            }
        });
    }

    fn with_image(&mut self, draw: impl FnOnce(&mut RgbImage)) {
        let (width, height) = (self.frame.width, self.frame.height);
        let data = std::mem::take(&mut self.frame.data);
        match RgbImage::from_raw(width, height, data) {
            Some(mut img) => {
                draw(&mut img);
                self.frame.data = img.into_raw();
            }
            None => {
                warn!(width, height, "render surface buffer has the wrong size; resetting");
                self.frame = RgbFrame::black(width, height);
            }
        }
    }
}
