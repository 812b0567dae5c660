//! Position model for the single linear axis.
//!
//! Positions are integer step counts from the device zero. The model holds the
//! *optimistic* position (updated as soon as a move is planned) and the travel
//! bounds `[0, floor(max_range_mm * steps_per_mm)]`.

/// Conversion between millimetres and device steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepScale {
    steps_per_mm: f64,
}

impl StepScale {
    /// Build a scale from the drive geometry.
    ///
    /// # Arguments
    /// * `steps_per_rev` - Microsteps per motor revolution
    /// * `mm_per_rev` - Linear travel per revolution (lead screw pitch)
    pub fn from_geometry(steps_per_rev: u32, mm_per_rev: f64) -> Self {
        Self {
            steps_per_mm: f64::from(steps_per_rev) / mm_per_rev,
        }
    }

    /// Steps per millimetre.
    pub fn steps_per_mm(&self) -> f64 {
        self.steps_per_mm
    }

    /// Convert millimetres to steps, truncating toward zero.
    ///
    /// Non-finite input maps to 0; out-of-range values saturate.
    pub fn mm_to_steps(&self, mm: f64) -> i64 {
        let steps = mm * self.steps_per_mm;
        if steps.is_finite() {
            steps.trunc() as i64
        } else {
            0
        }
    }

    /// Convert steps to millimetres.
    pub fn steps_to_mm(&self, steps: i64) -> f64 {
        steps as f64 / self.steps_per_mm
    }
}

/// Result of planning a move against the current optimistic position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    /// What the caller asked for, in steps.
    pub requested: i64,
    /// Requested target after clamping to the travel bounds.
    pub target: i64,
}

impl MovePlan {
    /// Whether clamping changed the requested target.
    pub fn clamped(&self) -> bool {
        self.requested != self.target
    }
}

/// Authoritative-until-corrected position estimate plus travel bounds.
#[derive(Debug, Clone)]
pub struct PositionModel {
    scale: StepScale,
    current: i64,
    min_steps: i64,
    max_steps: i64,
}

impl PositionModel {
    /// Create a model at position 0 with bounds `[0, max_range_mm]`.
    pub fn new(scale: StepScale, max_range_mm: f64) -> Self {
        let max_steps = (max_range_mm * scale.steps_per_mm()).floor();
        let max_steps = if max_steps.is_finite() && max_steps > 0.0 {
            max_steps as i64
        } else {
            0
        };

        Self {
            scale,
            current: 0,
            min_steps: 0,
            max_steps,
        }
    }

    /// Steps/mm conversion in use.
    pub fn scale(&self) -> StepScale {
        self.scale
    }

    /// Current optimistic position in steps.
    pub fn current(&self) -> i64 {
        self.current
    }

    /// Current optimistic position in millimetres.
    pub fn current_mm(&self) -> f64 {
        self.scale.steps_to_mm(self.current)
    }

    /// Travel bounds in steps, inclusive.
    pub fn bounds(&self) -> (i64, i64) {
        (self.min_steps, self.max_steps)
    }

    /// Whether `steps` lies inside the travel bounds.
    pub fn contains(&self, steps: i64) -> bool {
        (self.min_steps..=self.max_steps).contains(&steps)
    }

    /// `max(min_bound, min(max_bound, requested))`.
    pub fn clamp_target(&self, requested_steps: i64) -> i64 {
        requested_steps.min(self.max_steps).max(self.min_steps)
    }

    /// Clamped absolute target for a relative move from `current`.
    pub fn apply_relative(&self, current: i64, delta_steps: i64) -> i64 {
        self.clamp_target(current.saturating_add(delta_steps))
    }

    /// Plan a relative move from the optimistic position.
    pub fn plan_relative(&self, delta_steps: i64) -> MovePlan {
        MovePlan {
            requested: self.current.saturating_add(delta_steps),
            target: self.apply_relative(self.current, delta_steps),
        }
    }

    /// Plan an absolute move.
    pub fn plan_absolute(&self, requested_steps: i64) -> MovePlan {
        MovePlan {
            requested: requested_steps,
            target: self.clamp_target(requested_steps),
        }
    }

    /// Whether a plan leaves the position unchanged.
    pub fn is_noop(&self, plan: &MovePlan) -> bool {
        plan.target == self.current
    }

    /// Overwrite the position (optimistic update, calibration or device report).
    pub fn set_current(&mut self, steps: i64) {
        self.current = steps;
    }
}
