use crate::config::Config;
use roster_core::{BoundingBox, Detection};

/// Where an enrollment stability wait currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum StabilityState {
    /// The last sample did not have exactly one confident face.
    Searching,
    /// The face moved more than the tolerance since the previous sample.
    Moving,
    /// The face is holding still for `streak` consecutive samples.
    Holding { streak: usize },
    /// Enough still samples in a row; carries the final detection.
    Stable(Detection),
}

/// Waits for one confident face to stay still across consecutive samples
/// before an enrollment frame is taken.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: usize,
    tolerance: f32,
    min_score: f32,
    last: Option<BoundingBox>,
    streak: usize,
}

impl StabilityTracker {
    pub fn new(required: usize, tolerance: f32, min_score: f32) -> Self {
        Self {
            required: required.max(1),
            tolerance,
            min_score,
            last: None,
            streak: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.stability_frames,
            config.stability_tolerance,
            config.enroll_min_score,
        )
    }

    /// Feed the detections of one sample.
    pub fn observe(&mut self, detections: &[Detection]) -> StabilityState {
        let face = match detections {
            [face] if face.score > self.min_score => face,
            _ => {
                self.reset();
                return StabilityState::Searching;
            }
        };

        let Some(previous) = self.last.replace(face.bbox) else {
            return StabilityState::Holding { streak: 0 };
        };

        let dx = (face.bbox.x - previous.x).abs();
        let dy = (face.bbox.y - previous.y).abs();
        if dx < face.bbox.width * self.tolerance && dy < face.bbox.height * self.tolerance {
            self.streak += 1;
            if self.streak >= self.required {
                return StabilityState::Stable(face.clone());
            }
            StabilityState::Holding {
                streak: self.streak,
            }
        } else {
            self.streak = 0;
            StabilityState::Moving
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.streak = 0;
    }
}
