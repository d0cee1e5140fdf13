//! Poses and survival regions.
//!
//! Positions are metres in the play scene's world frame. Everything the host
//! replicates about an entity's transform is a `Pose`; the survival check at
//! the end of a round is a point-in-volume test against a `SurvivalRegion`.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Position + orientation of an entity in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// World position in metres
    pub position: Point3<f32>,

    /// World orientation
    pub rotation: UnitQuaternion<f32>,
}

impl Pose {
    /// Creates a pose from a position and rotation.
    pub fn new(position: Point3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self { position, rotation }
    }

    /// The world origin with no rotation.
    pub fn identity() -> Self {
        Self::new(Point3::origin(), UnitQuaternion::identity())
    }

    /// Creates an unrotated pose at `(x, y, z)`.
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self::new(Point3::new(x, y, z), UnitQuaternion::identity())
    }

    /// Returns the pose as a rigid transform.
    pub fn to_isometry(&self) -> Isometry3<f32> {
        Isometry3::from_parts(Translation3::from(self.position.coords), self.rotation)
    }

    /// Builds a pose from a rigid transform.
    pub fn from_isometry(iso: &Isometry3<f32>) -> Self {
        Self::new(Point3::from(iso.translation.vector), iso.rotation)
    }

    /// Applies a local offset expressed in this pose's frame.
    ///
    /// `parent.compose(&offset)` is the world pose of something sitting at
    /// `offset` relative to `parent`.
    pub fn compose(&self, local: &Pose) -> Pose {
        Self::from_isometry(&(self.to_isometry() * local.to_isometry()))
    }

    /// Expresses this pose in `parent`'s local frame.
    ///
    /// Inverse of [`Pose::compose`]: `parent.compose(&p.relative_to(&parent)) == p`.
    pub fn relative_to(&self, parent: &Pose) -> Pose {
        Self::from_isometry(&(parent.to_isometry().inverse() * self.to_isometry()))
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// The bounding volume an entity must be inside when the countdown ends.
///
/// Points exactly on the boundary count as inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SurvivalRegion {
    /// Axis-aligned box
    Box {
        center: Point3<f32>,
        half_extents: Vector3<f32>,
    },

    /// Sphere
    Sphere {
        center: Point3<f32>,
        radius: f32,
    },
}

impl SurvivalRegion {
    /// Creates an axis-aligned box region.
    pub fn aabb(center: Point3<f32>, half_extents: Vector3<f32>) -> Self {
        Self::Box {
            center,
            half_extents: half_extents.abs(),
        }
    }

    /// Creates a spherical region.
    pub fn sphere(center: Point3<f32>, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.abs(),
        }
    }

    /// Returns true if `point` lies inside or on the boundary of the region.
    ///
    /// Non-finite points are never inside.
    pub fn contains(&self, point: &Point3<f32>) -> bool {
        if !point.coords.iter().all(|c| c.is_finite()) {
            return false;
        }

        match self {
            SurvivalRegion::Box { center, half_extents } => {
                let d = (point - center).abs();
                d.x <= half_extents.x && d.y <= half_extents.y && d.z <= half_extents.z
            }
            SurvivalRegion::Sphere { center, radius } => {
                (point - center).norm_squared() <= radius * radius
            }
        }
    }
}
