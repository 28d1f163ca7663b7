use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Width/height ratio; zero-height boxes yield infinity and are
    /// rejected by any finite aspect range.
    pub fn aspect_ratio(&self) -> f32 {
        let h = self.height();
        if h == 0.0 {
            f32::INFINITY
        } else {
            self.width() / h
        }
    }
}

/// One detected region within a source image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
}

/// Ordered detection list for one image. Empty when the detector found
/// nothing (or its chunk failed).
pub type DetectionResult = Vec<Detection>;
