//! Buffer probes and the per-frame annotation probe

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{Level, log};
use serde::{Deserialize, Serialize};

use super::types::{
    BBox, Buffer, Color, FontParams, Frame, OverlayDescriptor, RectParams, TextParams,
};

/// Callback run synchronously on every buffer entering a stage
///
/// Probes must not block: they run on the stage task, before the stage sees
/// the buffer.
pub trait Probe: Send {
    fn on_buffer(&mut self, buffer: &mut Buffer);
}

pub type SharedProbe = Arc<Mutex<dyn Probe>>;

/// Wrap a probe so that it can be attached to a stage input
pub fn shared<P: Probe + 'static>(probe: P) -> SharedProbe {
    Arc::new(Mutex::new(probe))
}

/// Run every probe of an input over one buffer
pub(crate) fn apply(probes: &[SharedProbe], buffer: &mut Buffer) {
    for probe in probes {
        // a panicking probe poisons only itself; keep feeding it
        let mut probe = probe.lock().unwrap_or_else(|p| p.into_inner());
        probe.on_buffer(buffer);
    }
}

/// Per-frame counts reach the default log level once per this many frames
pub const COUNT_LOG_INTERVAL: u64 = 15;

/// Level of the count line for the frame numbered `number`
pub fn count_log_level(number: u64) -> Level {
    if number % COUNT_LOG_INTERVAL == 0 {
        Level::Info
    } else {
        Level::Debug
    }
}

/// Process-scoped count of annotated frames
#[derive(Debug, Clone, Default)]
pub struct FrameCounter(Arc<AtomicU64>);

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame, returning its zero-based number
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A detection class the probe counts and labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedClass {
    pub id: u32,
    pub label: String,
    /// Bounding box colour as RGBA in `0.0..=1.0`
    #[serde(default = "default_box_color")]
    pub color: [f32; 4],
}

fn default_box_color() -> [f32; 4] {
    [0.0, 1.0, 0.0, 1.0]
}

impl TrackedClass {
    pub fn new(id: u32, label: &str, color: [f32; 4]) -> Self {
        Self {
            id,
            label: label.to_string(),
            color,
        }
    }

    /// Person (class 2) then Vehicle (class 0)
    pub fn defaults() -> Vec<TrackedClass> {
        vec![
            TrackedClass::new(2, "Person", [0.0, 1.0, 0.0, 1.0]),
            TrackedClass::new(0, "Vehicle", [1.0, 0.0, 0.0, 1.0]),
        ]
    }
}

/// Placement and look of the count label
#[derive(Debug, Clone)]
pub struct LabelStyle {
    pub x_offset: u32,
    pub y_offset: u32,
    pub font: FontParams,
    pub background: Option<Color>,
    pub box_border_width: u32,
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            x_offset: 10,
            y_offset: 12,
            font: FontParams {
                name: "Courier".to_string(),
                size: 24,
                color: Color::WHITE,
            },
            background: Some(Color::BLACK),
            box_border_width: 2,
        }
    }
}

/// Counts tracked detections per frame and attaches drawing directives
pub struct AnnotationProbe {
    classes: Vec<TrackedClass>,
    style: LabelStyle,
    counter: FrameCounter,
}

impl AnnotationProbe {
    pub fn new(classes: Vec<TrackedClass>, style: LabelStyle, counter: FrameCounter) -> Self {
        Self {
            classes,
            style,
            counter,
        }
    }

    /// Tally the frame's detections and attach its overlay descriptor
    pub fn on_frame(&mut self, frame: &mut Frame) {
        let mut counts = vec![0usize; self.classes.len()];
        let mut rects = Vec::new();

        for detection in &frame.detections {
            let Some(slot) = self.classes.iter().position(|c| c.id == detection.class_id) else {
                continue;
            };
            counts[slot] += 1;
            rects.push(RectParams {
                bbox: detection.bbox,
                border_width: self.style.box_border_width,
                border_color: color_from(self.classes[slot].color),
            });
        }

        let text = self
            .classes
            .iter()
            .zip(&counts)
            .map(|(class, count)| format!("{} = {}", class.label, count))
            .collect::<Vec<_>>()
            .join(" ");

        let number = self.counter.next();
        let tallies = self
            .classes
            .iter()
            .zip(&counts)
            .map(|(class, count)| format!("{} Count = {}", class.label, count))
            .collect::<Vec<_>>()
            .join(" ");
        let level = count_log_level(number);
        match frame.batch {
            Some(info) => log!(
                level,
                "Frame Number = {} Number of objects = {} {} (batch {} [{}/{}])",
                number,
                frame.detections.len(),
                tallies,
                info.batch_id,
                info.index + 1,
                info.len
            ),
            None => log!(
                level,
                "Frame Number = {} Number of objects = {} {}",
                number,
                frame.detections.len(),
                tallies
            ),
        }

        let overlay = frame.overlay.get_or_insert_with(OverlayDescriptor::default);
        overlay.texts.push(TextParams {
            text,
            x_offset: self.style.x_offset,
            y_offset: self.style.y_offset,
            font: self.style.font.clone(),
            background: self.style.background,
        });
        overlay.rects.extend(rects);
    }
}

impl Probe for AnnotationProbe {
    fn on_buffer(&mut self, buffer: &mut Buffer) {
        match buffer {
            Buffer::Frame(frame) => self.on_frame(frame),
            Buffer::Batch(batch) => batch.frames.iter_mut().for_each(|f| self.on_frame(f)),
            Buffer::Packet(_) => {}
        }
    }
}

fn color_from([red, green, blue, alpha]: [f32; 4]) -> Color {
    Color::rgba(red, green, blue, alpha)
}

/// Bounding box clamped to a picture of the given size, in whole pixels
pub fn clamp_bbox(bbox: &BBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let left = bbox.left.max(0.0).floor() as u32;
    let top = bbox.top.max(0.0).floor() as u32;
    let right = ((bbox.left + bbox.width).ceil().max(0.0) as u32).min(width);
    let bottom = ((bbox.top + bbox.height).ceil().max(0.0) as u32).min(height);
    (left < right && top < bottom).then_some((left, top, right, bottom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::caps::{Format, MediaType};
    use crate::pipeline::types::{Detection, Timestamp};
    use bytes::Bytes;

    fn detection(class_id: u32) -> Detection {
        Detection {
            class_id,
            bbox: BBox {
                left: 4.0,
                top: 4.0,
                width: 10.0,
                height: 20.0,
            },
            confidence: 0.9,
        }
    }

    fn frame_with(classes: &[u32]) -> Frame {
        let mut frame = Frame::new(
            Format::new(MediaType::RawVideo),
            Bytes::new(),
            Timestamp::default(),
            0,
        );
        frame.detections = classes.iter().map(|c| detection(*c)).collect();
        frame
    }

    fn probe() -> AnnotationProbe {
        AnnotationProbe::new(
            TrackedClass::defaults(),
            LabelStyle::default(),
            FrameCounter::new(),
        )
    }

    #[test]
    fn test_counts_tracked_classes() {
        let mut probe = probe();
        let mut frame = frame_with(&[2, 2, 0, 5]);
        probe.on_frame(&mut frame);

        let overlay = frame.overlay.expect("overlay attached");
        assert_eq!(overlay.texts.len(), 1);
        let label = &overlay.texts[0];
        assert_eq!(label.text, "Person = 2 Vehicle = 1");
        assert_eq!((label.x_offset, label.y_offset), (10, 12));
        assert_eq!(label.font.name, "Courier");
        assert_eq!(label.font.size, 24);
        assert_eq!(label.font.color, Color::WHITE);
        assert_eq!(label.background, Some(Color::BLACK));
        // class 5 is not tracked
        assert_eq!(overlay.rects.len(), 3);
    }

    #[test]
    fn test_shuffled_persons_and_vehicles() {
        let mut probe = probe();
        let mut frame = frame_with(&[0, 2, 2, 0, 2, 7, 2, 0, 2]);
        probe.on_frame(&mut frame);

        let overlay = frame.overlay.unwrap();
        assert_eq!(overlay.texts.len(), 1);
        assert_eq!(overlay.texts[0].text, "Person = 5 Vehicle = 3");
        assert_eq!(overlay.rects.len(), 8);
        let red = Color::rgba(1.0, 0.0, 0.0, 1.0);
        assert_eq!(overlay.rects.iter().filter(|r| r.border_color == red).count(), 3);
    }

    #[test]
    fn test_count_lines_throttled() {
        assert_eq!(count_log_level(0), Level::Info);
        assert_eq!(count_log_level(1), Level::Debug);
        assert_eq!(count_log_level(COUNT_LOG_INTERVAL - 1), Level::Debug);
        assert_eq!(count_log_level(COUNT_LOG_INTERVAL), Level::Info);
    }

    #[test]
    fn test_empty_frame_still_labelled() {
        let mut probe = probe();
        let mut frame = frame_with(&[]);
        probe.on_frame(&mut frame);
        assert_eq!(
            frame.overlay.unwrap().texts[0].text,
            "Person = 0 Vehicle = 0"
        );
    }

    #[test]
    fn test_counter_advances_once_per_frame() {
        let counter = FrameCounter::new();
        let mut probe = AnnotationProbe::new(
            TrackedClass::defaults(),
            LabelStyle::default(),
            counter.clone(),
        );
        for _ in 0..5 {
            probe.on_buffer(&mut Buffer::Frame(frame_with(&[0])));
        }
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_configured_classes_and_order() {
        let mut probe = AnnotationProbe::new(
            vec![
                TrackedClass::new(1, "TwoWheeler", [1.0, 1.0, 0.0, 1.0]),
                TrackedClass::new(3, "Roadsign", [0.0, 0.0, 1.0, 1.0]),
            ],
            LabelStyle::default(),
            FrameCounter::new(),
        );
        let mut frame = frame_with(&[3, 1, 3, 2]);
        probe.on_frame(&mut frame);
        assert_eq!(
            frame.overlay.unwrap().texts[0].text,
            "TwoWheeler = 1 Roadsign = 2"
        );
    }

    #[test]
    fn test_clamp_bbox() {
        let bbox = BBox {
            left: -5.0,
            top: 10.0,
            width: 20.0,
            height: 100.0,
        };
        assert_eq!(clamp_bbox(&bbox, 64, 48), Some((0, 10, 15, 48)));

        let outside = BBox {
            left: 100.0,
            top: 0.0,
            width: 5.0,
            height: 5.0,
        };
        assert_eq!(clamp_bbox(&outside, 64, 48), None);
    }
}
