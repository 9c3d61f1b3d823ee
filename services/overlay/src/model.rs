//! Detection data handed between the channel, the delivery queues and the
//! renderer.

use std::fmt;

/// Stream-relative frame identifier.
pub type FrameId = u64;

/// Identifier of a box within one frame.
pub type BoxId = u64;

/// Identifier of an operator-confirmed tracked object.
pub type ObjectId = u64;

/// Camera identifier as used on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CameraId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CameraId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Axis-aligned rectangle in normalized stream coordinates.
///
/// Built from two opposite corners given in any orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
}

impl Rect {
    /// Build from `[x1, y1, x2, y2]`, swapping corners as needed.
    pub fn from_corners(corners: [f64; 4]) -> Self {
        let [x1, y1, x2, y2] = corners;
        Self {
            left: x1.min(x2),
            top: y1.min(y2),
            right: x1.max(x2),
            bottom: y1.max(y2),
        }
    }

    pub fn left(&self) -> f64 {
        self.left
    }

    pub fn top(&self) -> f64 {
        self.top
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    pub fn is_finite(&self) -> bool {
        self.left.is_finite()
            && self.top.is_finite()
            && self.right.is_finite()
            && self.bottom.is_finite()
    }
}

/// A detected region within one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub box_id: BoxId,
    pub rect: Rect,
    pub object_type: String,
    /// Present once an operator has confirmed tracking
    pub object_id: Option<ObjectId>,
}

impl BoundingBox {
    pub fn new(
        box_id: BoxId,
        corners: [f64; 4],
        object_type: impl Into<String>,
        object_id: Option<ObjectId>,
    ) -> Self {
        Self {
            box_id,
            rect: Rect::from_corners(corners),
            object_type: object_type.into(),
            object_id,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.object_id.is_some()
    }
}

/// All boxes detected in one frame of one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBatch {
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub boxes: Vec<BoundingBox>,
}

impl FrameBatch {
    pub fn find_box(&self, box_id: BoxId) -> Option<&BoundingBox> {
        self.boxes.iter().find(|b| b.box_id == box_id)
    }

    /// Tracked-object identifiers present in this batch.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.boxes.iter().filter_map(|b| b.object_id)
    }
}

/// Rectangle in view pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Maps normalized stream coordinates onto a view that displays the video
/// scaled to fit (letterboxed on the short axis).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportTransform {
    scale_x: f64,
    scale_y: f64,
    offset_x: f64,
    offset_y: f64,
}

impl ViewportTransform {
    /// Plain scaling with no letterboxing.
    pub fn stretch(view_width: f64, view_height: f64) -> Self {
        Self {
            scale_x: view_width,
            scale_y: view_height,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    /// Fit a video of `intrinsic` pixels into a view of `view` pixels,
    /// preserving aspect ratio. Falls back to stretching when the intrinsic
    /// size is not known yet.
    pub fn fit(intrinsic: Option<(u32, u32)>, view: (f64, f64)) -> Self {
        let (view_width, view_height) = view;
        let (video_width, video_height) = match intrinsic {
            Some((w, h)) if w > 0 && h > 0 => (w as f64, h as f64),
            _ => return Self::stretch(view_width, view_height),
        };

        let scale = (view_width / video_width).min(view_height / video_height);
        let drawn_width = video_width * scale;
        let drawn_height = video_height * scale;

        Self {
            scale_x: drawn_width,
            scale_y: drawn_height,
            offset_x: (view_width - drawn_width) / 2.0,
            offset_y: (view_height - drawn_height) / 2.0,
        }
    }

    pub fn apply(&self, rect: &Rect) -> PixelRect {
        PixelRect {
            left: self.offset_x + rect.left() * self.scale_x,
            top: self.offset_y + rect.top() * self.scale_y,
            width: rect.width() * self.scale_x,
            height: rect.height() * self.scale_y,
        }
    }
}
