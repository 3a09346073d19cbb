use std::time::Duration;

use blockvale_shared::coords::ColumnPos;
use glam::{Vec2, Vec3};

use crate::config::PipelineSettings;

/// Alignment above which the forward bonus applies.
const FORWARD_ALIGNMENT: f32 = 0.6;
/// Alignment below which the backward penalty applies.
const BACKWARD_ALIGNMENT: f32 = -0.4;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub load_radius: i32,
    pub unload_margin: i32,
    pub forward_bonus: i32,
    pub backward_penalty: i32,
    pub world_limit: i32,
    pub unload_grace: Duration,
}

impl StreamingConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            load_radius: settings.load_radius,
            unload_margin: settings.unload_margin,
            forward_bonus: settings.forward_bonus,
            backward_penalty: settings.backward_penalty,
            world_limit: settings.world_limit,
            unload_grace: settings.unload_grace(),
        }
    }

    fn biased(&self, radius: i32, alignment: f32) -> i32 {
        if alignment > FORWARD_ALIGNMENT {
            radius + self.forward_bonus
        } else if alignment < BACKWARD_ALIGNMENT {
            (radius - self.backward_penalty).max(0)
        } else {
            radius
        }
    }

    pub fn load_radius_toward(&self, dx: i32, dz: i32, forward: Vec2) -> i32 {
        self.biased(self.load_radius, alignment(dx, dz, forward))
    }

    pub fn unload_radius_toward(&self, dx: i32, dz: i32, forward: Vec2) -> i32 {
        self.biased(self.load_radius + self.unload_margin, alignment(dx, dz, forward))
    }

    pub fn within_world_limit(&self, pos: ColumnPos) -> bool {
        let limit = i64::from(self.world_limit);
        pos.distance_sq(ColumnPos::new(0, 0)) <= limit * limit
    }

    /// Every column the observer should have loaded, nearest first. The centre
    /// column is always included when it lies inside the world limit.
    pub fn desired_columns(&self, center: ColumnPos, forward: Vec2) -> Vec<ColumnPos> {
        let reach = self.load_radius + self.forward_bonus;
        let mut desired = Vec::new();

        for dz in -reach..=reach {
            for dx in -reach..=reach {
                let radius = i64::from(self.load_radius_toward(dx, dz, forward));
                let dist_sq = i64::from(dx * dx + dz * dz);
                if dist_sq > radius * radius {
                    continue;
                }

                let pos = center + ColumnPos::new(dx, dz);
                if self.within_world_limit(pos) {
                    desired.push(pos);
                }
            }
        }

        sort_columns_nearest(&mut desired, center);
        desired
    }

    pub fn should_unload(&self, center: ColumnPos, pos: ColumnPos, forward: Vec2) -> bool {
        let offset = pos - center;
        let radius = i64::from(self.unload_radius_toward(offset.x, offset.z, forward));
        offset.distance_sq(ColumnPos::new(0, 0)) > radius * radius || !self.within_world_limit(pos)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

/// Cosine between the column offset and the horizontal facing. Zero when either is degenerate.
pub fn alignment(dx: i32, dz: i32, forward: Vec2) -> f32 {
    let offset = Vec2::new(dx as f32, dz as f32);
    match (offset.try_normalize(), forward.try_normalize()) {
        (Some(offset), Some(forward)) => offset.dot(forward),
        _ => 0.0,
    }
}

pub fn horizontal_forward(forward: Vec3) -> Vec2 {
    Vec2::new(forward.x, forward.z)
}

pub fn sort_columns_nearest(columns: &mut [ColumnPos], center: ColumnPos) {
    columns.sort_by_key(|pos| (pos.distance_sq(center), pos.z, pos.x));
}
