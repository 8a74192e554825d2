//! Entity model: virtual pointers and their behaviors
//!
//! Each behavior variant carries only the parameters it uses. The numeric
//! code of a behavior is part of the event protocol (`added`, `updated`,
//! `cursor`) and must stay stable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::ProtocolError;

/// Identifier of a live entity. Always positive.
pub type EntityId = u32;

/// Accepted render sizes.
pub const SIZE_RANGE: (f64, f64) = (3.0, 399.0);
/// Accepted orbit radii.
pub const RADIUS_RANGE: (f64, f64) = (0.0, 10_000.0);
/// Accepted angular speeds in radians per second.
pub const SPEED_RANGE: (f64, f64) = (-100.0, 100.0);
/// Accepted follow lag time constants in milliseconds.
pub const LAG_RANGE: (f64, f64) = (1.0, 60_000.0);
/// Accepted absolute or relative coordinates.
pub const COORD_RANGE: (f64, f64) = (-100_000.0, 100_000.0);

/// Clamp `value` into an inclusive `(min, max)` range.
pub fn clamp(value: f64, range: (f64, f64)) -> f64 {
    value.max(range.0).min(range.1)
}

/// A point in screen space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Point {
    /// Create a point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Translate by `(dx, dy)`.
    pub fn offset(&self, dx: f64, dy: f64) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

/// 24-bit render color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    /// Red channel
    pub r: u8,
    /// Green channel
    pub g: u8,
    /// Blue channel
    pub b: u8,
}

impl Color {
    /// Create a color from channels.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse the strict `#RRGGBB` form.
    pub fn parse(text: &str) -> Option<Color> {
        let hex = text.strip_prefix('#')?;
        if text.len() != 7 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Color::rgb(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::rgb(0, 200, 255)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Behavior discriminant, used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BehaviorKind {
    /// Track the reference point at a fixed offset
    Mirror,
    /// Sit at a fixed target
    Static,
    /// Circle around the reference point
    Orbit,
    /// Chase the reference point with a time-constant lag
    FollowLag,
    /// Driven by an external script process
    Scripted,
}

impl BehaviorKind {
    /// Numeric code carried by events.
    pub fn code(self) -> u8 {
        match self {
            BehaviorKind::Mirror => 0,
            BehaviorKind::Static => 1,
            BehaviorKind::Orbit => 2,
            BehaviorKind::FollowLag => 3,
            BehaviorKind::Scripted => 4,
        }
    }

    /// Protocol name, as accepted by the `behavior` field.
    pub fn name(self) -> &'static str {
        match self {
            BehaviorKind::Mirror => "mirror",
            BehaviorKind::Static => "static",
            BehaviorKind::Orbit => "orbit",
            BehaviorKind::FollowLag => "follow",
            BehaviorKind::Scripted => "script",
        }
    }
}

impl FromStr for BehaviorKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mirror" => Ok(BehaviorKind::Mirror),
            "static" => Ok(BehaviorKind::Static),
            "orbit" => Ok(BehaviorKind::Orbit),
            "follow" | "followlag" => Ok(BehaviorKind::FollowLag),
            "script" => Ok(BehaviorKind::Scripted),
            other => Err(ProtocolError::UnknownBehavior(other.to_string())),
        }
    }
}

/// Positional update rule with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// `position = R + offset`
    Mirror {
        /// Horizontal offset from the reference point
        offset_x: f64,
        /// Vertical offset from the reference point
        offset_y: f64,
    },
    /// `position = target`
    Static {
        /// Fixed position
        target: Point,
    },
    /// `position = R + radius * (cos angle, sin angle)`
    Orbit {
        /// Orbit radius in pixels
        radius: f64,
        /// Angular speed in radians per second
        speed: f64,
        /// Current angle in radians
        angle: f64,
    },
    /// Exponential chase of the reference point
    FollowLag {
        /// Time constant in milliseconds
        lag_ms: f64,
        /// Whether the first tick has snapped the position to `R`
        initialized: bool,
    },
    /// Position supplied by a script subprocess
    Scripted {
        /// Script handed to the script host
        script: PathBuf,
        /// Last position reported by the script
        target: Point,
    },
}

/// Default orbit radius.
pub const DEFAULT_RADIUS: f64 = 60.0;
/// Default orbit speed.
pub const DEFAULT_SPEED: f64 = 1.0;
/// Default follow lag.
pub const DEFAULT_LAG_MS: f64 = 120.0;
/// Default render size.
pub const DEFAULT_SIZE: u32 = 12;

impl Behavior {
    /// Variant of `kind` with default parameters.
    pub fn default_for(kind: BehaviorKind) -> Behavior {
        match kind {
            BehaviorKind::Mirror => Behavior::Mirror {
                offset_x: 0.0,
                offset_y: 0.0,
            },
            BehaviorKind::Static => Behavior::Static {
                target: Point::default(),
            },
            BehaviorKind::Orbit => Behavior::Orbit {
                radius: DEFAULT_RADIUS,
                speed: DEFAULT_SPEED,
                angle: 0.0,
            },
            BehaviorKind::FollowLag => Behavior::FollowLag {
                lag_ms: DEFAULT_LAG_MS,
                initialized: false,
            },
            BehaviorKind::Scripted => Behavior::Scripted {
                script: PathBuf::new(),
                target: Point::default(),
            },
        }
    }

    /// Discriminant of this behavior.
    pub fn kind(&self) -> BehaviorKind {
        match self {
            Behavior::Mirror { .. } => BehaviorKind::Mirror,
            Behavior::Static { .. } => BehaviorKind::Static,
            Behavior::Orbit { .. } => BehaviorKind::Orbit,
            Behavior::FollowLag { .. } => BehaviorKind::FollowLag,
            Behavior::Scripted { .. } => BehaviorKind::Scripted,
        }
    }

    /// Script path, for scripted behaviors with a non-empty path.
    pub fn script(&self) -> Option<&PathBuf> {
        match self {
            Behavior::Scripted { script, .. } if !script.as_os_str().is_empty() => Some(script),
            _ => None,
        }
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior::default_for(BehaviorKind::Mirror)
    }
}

/// One virtual pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Store-unique id; 0 asks the store to assign one
    pub id: EntityId,
    /// Positional update rule
    pub behavior: Behavior,
    /// Current render position
    pub position: Point,
    /// Render size in pixels
    pub size: u32,
    /// Render color
    pub color: Color,
    /// Whether a script subprocess is currently running for this entity
    pub script_running: bool,
}

impl Entity {
    /// Entity with the given behavior and default render parameters.
    pub fn new(behavior: Behavior) -> Self {
        let position = match &behavior {
            Behavior::Static { target } | Behavior::Scripted { target, .. } => *target,
            _ => Point::default(),
        };
        Self {
            id: 0,
            behavior,
            position,
            size: DEFAULT_SIZE,
            color: Color::default(),
            script_running: false,
        }
    }

    /// Builder-style size setter, clamped.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = clamp(size as f64, SIZE_RANGE) as u32;
        self
    }

    /// Builder-style color setter.
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    /// Behavior discriminant.
    pub fn kind(&self) -> BehaviorKind {
        self.behavior.kind()
    }
}
