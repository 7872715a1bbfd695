//! Spatial math for entity transforms.
//!
//! Positions are metres in the server's y-up coordinate space. A direction
//! is the euler triple the server streams: `x` holds roll (about the
//! forward z axis), `y` holds pitch (about the right x axis), `z` holds yaw
//! (about the up y axis), composed yaw first, then pitch, then roll.

use std::ops::{Add, AddAssign, Sub};

/// Sentinel the server writes for an axis that did not change.
pub const FLT_MAX: f32 = f32::MAX;

/// Tolerance for angle and coordinate comparisons.
pub const ALMOST_EQ_EPSILON: f32 = 0.0004;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Vec3 {
        Vec3 { x, y, z }
    }

    pub fn distance(self, other: Vec3) -> f32 {
        let d = self - other;
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    pub fn almost_eq(self, other: Vec3) -> bool {
        almost_equal(self.x, other.x)
            && almost_equal(self.y, other.y)
            && almost_equal(self.z, other.z)
    }

    fn cross(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    fn scaled(self, s: f32) -> Vec3 {
        Vec3 {
            x: self.x * s,
            y: self.y * s,
            z: self.z * s,
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, other: Vec3) {
        *self = *self + other;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }
}

/// Unit quaternion. Only built from euler directions, so no normalization
/// step is needed anywhere.
#[derive(Debug, Clone, Copy)]
pub struct Quat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quat {
    fn mul(self, rhs: Quat) -> Quat {
        Quat {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }

    fn conjugate(self) -> Quat {
        Quat {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    fn rotate(self, v: Vec3) -> Vec3 {
        let u = Vec3::new(self.x, self.y, self.z);
        let t = u.cross(v) + v.scaled(self.w);
        v + u.cross(t).scaled(2.0)
    }
}

/// Builds the rotation a (roll, pitch, yaw) direction describes.
pub fn quat_from_direction(dir: Vec3) -> Quat {
    let (sr, cr) = (dir.x * 0.5).sin_cos();
    let (sp, cp) = (dir.y * 0.5).sin_cos();
    let (sy, cy) = (dir.z * 0.5).sin_cos();
    // yaw about y, then pitch about x, then roll about z.
    Quat {
        w: cr * cp * cy + sr * sp * sy,
        x: cr * sp * cy + sr * cp * sy,
        y: cr * cp * sy - sr * sp * cy,
        z: sr * cp * cy - cr * sp * sy,
    }
}

/// Recovers the (roll, pitch, yaw) direction from a rotation. Pitch is
/// clamped into [-pi/2, pi/2].
pub fn direction_from_quat(q: Quat) -> Vec3 {
    let sin_pitch = (2.0 * (q.w * q.x - q.y * q.z)).clamp(-1.0, 1.0);
    Vec3 {
        x: (2.0 * (q.x * q.y + q.w * q.z)).atan2(1.0 - 2.0 * (q.x * q.x + q.z * q.z)),
        y: sin_pitch.asin(),
        z: (2.0 * (q.x * q.z + q.w * q.y)).atan2(1.0 - 2.0 * (q.x * q.x + q.y * q.y)),
    }
}

pub fn position_local_to_world(parent_pos: Vec3, parent_dir: Vec3, local: Vec3) -> Vec3 {
    quat_from_direction(parent_dir).rotate(local) + parent_pos
}

pub fn position_world_to_local(parent_pos: Vec3, parent_dir: Vec3, world: Vec3) -> Vec3 {
    quat_from_direction(parent_dir)
        .conjugate()
        .rotate(world - parent_pos)
}

pub fn direction_local_to_world(parent_dir: Vec3, local_dir: Vec3) -> Vec3 {
    direction_from_quat(quat_from_direction(parent_dir).mul(quat_from_direction(local_dir)))
}

pub fn direction_world_to_local(parent_dir: Vec3, world_dir: Vec3) -> Vec3 {
    direction_from_quat(
        quat_from_direction(parent_dir)
            .conjugate()
            .mul(quat_from_direction(world_dir)),
    )
}

/// Expands a packed angle byte back to radians. Half-range packing maps
/// the full i8 span onto half a turn instead of a whole one.
pub fn int8_to_angle(v: i8, half: bool) -> f32 {
    v as f32 * (std::f32::consts::PI / if half { 254.0 } else { 128.0 })
}

pub fn almost_equal(lhs: f32, rhs: f32) -> bool {
    (lhs - rhs).abs() < ALMOST_EQ_EPSILON
}
