//! Plain value types decoded by the cursor.

use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A rotation quaternion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

/// The 22-byte quantized transform used by replay samples, kept exactly as stored so it writes
/// back bit-for-bit. Call [`unpack`][PackedTransform::unpack] for the decoded values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PackedTransform {
    pub position: Vec3,
    /// Rotation angle, 0..=65535 mapped onto [0, π].
    pub angle: u16,
    /// Rotation axis heading, mapped onto [-π, π].
    pub axis_heading: i16,
    /// Rotation axis pitch, mapped onto [-π/2, π/2].
    pub axis_pitch: i16,
    /// Speed as `exp(speed / 1000)`.
    pub speed: i16,
    pub velocity_heading: i8,
    pub velocity_pitch: i8,
}

/// A decoded [`PackedTransform`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub speed: f32,
    pub velocity: Vec3,
}

impl PackedTransform {
    /// Encoded size in bytes.
    pub const SIZE: usize = 22;

    pub fn unpack(&self) -> Transform {
        let angle = self.angle as f64 / u16::MAX as f64 * PI;
        let axis_heading = self.axis_heading as f64 / i16::MAX as f64 * PI;
        let axis_pitch = self.axis_pitch as f64 / i16::MAX as f64 * FRAC_PI_2;
        let speed = (self.speed as f64 / 1000.0).exp();
        let velocity_heading = self.velocity_heading as f64 / i8::MAX as f64 * PI;
        let velocity_pitch = self.velocity_pitch as f64 / i8::MAX as f64 * FRAC_PI_2;

        let (sin_a, cos_a) = angle.sin_cos();
        let rotation = Quat {
            x: (sin_a * axis_pitch.cos() * axis_heading.cos()) as f32,
            y: (sin_a * axis_pitch.cos() * axis_heading.sin()) as f32,
            z: (sin_a * axis_pitch.sin()) as f32,
            w: cos_a as f32,
        };
        let velocity = Vec3 {
            x: (speed * velocity_pitch.cos() * velocity_heading.cos()) as f32,
            y: (speed * velocity_pitch.cos() * velocity_heading.sin()) as f32,
            z: (speed * velocity_pitch.sin()) as f32,
        };

        Transform {
            position: self.position,
            rotation,
            speed: speed as f32,
            velocity,
        }
    }
}

/// A signed span of time. Stored as seconds in an `f64`, which holds every `i32` second or
/// millisecond count and every `f32` value exactly enough to write them back unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TimeSpan {
    seconds: f64,
}

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan { seconds: 0.0 };

    pub fn from_secs_f64(seconds: f64) -> Self {
        Self { seconds }
    }

    pub fn from_millis_f64(millis: f64) -> Self {
        Self {
            seconds: millis / 1000.0,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.seconds * 1000.0
    }

    pub fn is_negative(&self) -> bool {
        self.seconds < 0.0
    }
}

/// A reference to a file on disk or at a locator URL, as embedded in some chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub version: u8,
    /// Present from version 3 on.
    pub checksum: Option<[u8; 32]>,
    pub file_path: String,
    pub locator_url: String,
}

impl FileRef {
    /// Whether the locator URL field is present on the wire.
    pub(crate) fn has_locator(&self) -> bool {
        (!self.file_path.is_empty() && self.version >= 1) || self.version >= 3
    }
}
