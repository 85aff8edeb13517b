use anyhow::{Result, bail};

use crate::pipeline::caps::{Caps, CapsSet, Format, MediaType, PixelLayout};
use crate::pipeline::probe::clamp_bbox;
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::types::{BBox, Buffer, Color, Frame, TextParams};

/// Monospace advance relative to the font size
const GLYPH_ASPECT: f32 = 0.6;
/// Line height relative to the font size
const LINE_HEIGHT: f32 = 1.2;

/// Renders the overlay descriptor attached to each frame
///
/// Draws rectangle outlines and the background box of every text label,
/// then drops the descriptor. Glyphs are left to a font renderer.
pub struct OverlayStage {
    drawn: u64,
}

impl OverlayStage {
    pub fn new() -> Self {
        Self { drawn: 0 }
    }

    pub fn drawn(&self) -> u64 {
        self.drawn
    }

    fn render(&mut self, frame: &mut Frame) -> Result<()> {
        let Some(overlay) = frame.overlay.take() else {
            return Ok(());
        };
        if overlay.texts.is_empty() && overlay.rects.is_empty() {
            return Ok(());
        }
        let (Some(PixelLayout::Rgba), Some(width), Some(height)) =
            (frame.format.layout, frame.format.width, frame.format.height)
        else {
            bail!("overlay needs RGBA frames, got [{}]", frame.format);
        };

        let mut canvas = Canvas {
            data: frame.data.to_vec(),
            width,
            height,
        };
        if canvas.data.len() != PixelLayout::Rgba.frame_size(width, height) {
            bail!("frame {} has {} bytes for [{}]", frame.frame_num, canvas.data.len(), frame.format);
        }

        for rect in &overlay.rects {
            canvas.outline(&rect.bbox, rect.border_width, rect.border_color);
        }
        for text in &overlay.texts {
            if let Some(background) = text.background {
                canvas.fill(&text_box(text), background);
            }
        }

        frame.data = canvas.data.into();
        self.drawn += 1;
        Ok(())
    }
}

impl Default for OverlayStage {
    fn default() -> Self {
        Self::new()
    }
}

/// Area covered by a label
pub fn text_box(text: &TextParams) -> BBox {
    let size = text.font.size as f32;
    BBox {
        left: text.x_offset as f32,
        top: text.y_offset as f32,
        width: text.text.chars().count() as f32 * size * GLYPH_ASPECT,
        height: size * LINE_HEIGHT,
    }
}

struct Canvas {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Canvas {
    fn fill(&mut self, bbox: &BBox, color: Color) {
        let Some((left, top, right, bottom)) = clamp_bbox(bbox, self.width, self.height) else {
            return;
        };
        let [r, g, b, a] = color.to_rgba8();
        let alpha = a as u32;
        for y in top..bottom {
            for x in left..right {
                let i = ((y * self.width + x) * 4) as usize;
                let px = &mut self.data[i..i + 4];
                for (dst, src) in px.iter_mut().zip([r, g, b]) {
                    *dst = ((src as u32 * alpha + *dst as u32 * (255 - alpha)) / 255) as u8;
                }
                px[3] = 255;
            }
        }
    }

    fn outline(&mut self, bbox: &BBox, border: u32, color: Color) {
        let border = border.max(1) as f32;
        let edges = [
            BBox { height: border, ..*bbox },
            BBox {
                top: bbox.top + bbox.height - border,
                height: border,
                ..*bbox
            },
            BBox { width: border, ..*bbox },
            BBox {
                left: bbox.left + bbox.width - border,
                width: border,
                ..*bbox
            },
        ];
        for edge in &edges {
            self.fill(edge, color);
        }
    }
}

impl Transform for OverlayStage {
    fn kind(&self) -> StageKind {
        StageKind::Overlay
    }

    fn sink_caps(&self) -> CapsSet {
        Caps::new(MediaType::RawVideo)
            .with_layouts(&[PixelLayout::Rgba])
            .into()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        match input {
            Some(format) => Caps::from_format(format).into(),
            None => self.sink_caps(),
        }
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        match buffer {
            Buffer::Frame(mut frame) => {
                self.render(&mut frame)?;
                out.push(Buffer::Frame(frame));
            }
            Buffer::Batch(mut batch) => {
                for frame in &mut batch.frames {
                    self.render(frame)?;
                }
                out.push(Buffer::Batch(batch));
            }
            Buffer::Packet(_) => bail!("overlay cannot draw on packets"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::caps::Fraction;
    use crate::pipeline::probe::LabelStyle;
    use crate::pipeline::types::{OverlayDescriptor, RectParams, Timestamp};
    use bytes::Bytes;

    fn grey_frame(w: u32, h: u32) -> Frame {
        let format = Format::raw(PixelLayout::Rgba, w, h, Fraction::new(15, 1));
        Frame::new(format, Bytes::from(vec![128u8; (w * h * 4) as usize]), Timestamp::default(), 0)
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 4] {
        let w = frame.format.width.unwrap();
        let i = ((y * w + x) * 4) as usize;
        frame.data[i..i + 4].try_into().unwrap()
    }

    #[test]
    fn test_draws_label_background_and_boxes() {
        let style = LabelStyle::default();
        let mut frame = grey_frame(200, 60);
        frame.overlay = Some(OverlayDescriptor {
            texts: vec![TextParams {
                text: "Person = 1".to_string(),
                x_offset: style.x_offset,
                y_offset: style.y_offset,
                font: style.font.clone(),
                background: style.background,
            }],
            rects: vec![RectParams {
                bbox: BBox {
                    left: 180.0,
                    top: 40.0,
                    width: 10.0,
                    height: 10.0,
                },
                border_width: 2,
                border_color: Color::rgba(1.0, 0.0, 0.0, 1.0),
            }],
        });

        let mut stage = OverlayStage::new();
        let mut out = Vec::new();
        stage.transform(Buffer::Frame(frame), &mut out).unwrap();
        let Some(Buffer::Frame(frame)) = out.pop() else {
            panic!("no frame");
        };

        assert!(frame.overlay.is_none());
        // inside the label box
        assert_eq!(pixel(&frame, 12, 14), [0, 0, 0, 255]);
        // left of the label box
        assert_eq!(pixel(&frame, 5, 14), [128, 128, 128, 128]);
        // box border and interior
        assert_eq!(pixel(&frame, 180, 45), [255, 0, 0, 255]);
        assert_eq!(pixel(&frame, 185, 45), [128, 128, 128, 128]);
        assert_eq!(stage.drawn(), 1);
    }

    #[test]
    fn test_frames_without_overlay_pass_untouched() {
        let frame = grey_frame(4, 4);
        let data = frame.data.clone();
        let mut out = Vec::new();
        OverlayStage::new().transform(Buffer::Frame(frame), &mut out).unwrap();
        let Some(Buffer::Frame(frame)) = out.pop() else {
            panic!("no frame");
        };
        assert_eq!(frame.data, data);
    }
}
