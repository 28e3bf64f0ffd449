#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
        }
    }
}

/// Axis-aligned box stored as left/top/right/bottom edges in world pixels.
/// Top is the smaller `y`; the y axis grows downward.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aabb {
    pub l: f32,
    pub t: f32,
    pub r: f32,
    pub b: f32,
}

impl Aabb {
    pub fn new(l: f32, t: f32, r: f32, b: f32) -> Self {
        Self { l, t, r, b }
    }

    pub fn width(&self) -> f32 {
        self.r - self.l
    }

    pub fn height(&self) -> f32 {
        self.b - self.t
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.l <= other.r && self.r >= other.l && self.t <= other.b && self.b >= other.t
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.l <= other.l && self.t <= other.t && self.r >= other.r && self.b >= other.b
    }

    pub fn contains_point(&self, point: Vec2) -> bool {
        point.x >= self.l && point.x <= self.r && point.y >= self.t && point.y <= self.b
    }

    pub fn translated(self, offset: Vec2) -> Self {
        Self {
            l: self.l + offset.x,
            t: self.t + offset.y,
            r: self.r + offset.x,
            b: self.b + offset.y,
        }
    }

    pub fn expanded(self, margin: f32) -> Self {
        Self {
            l: self.l - margin,
            t: self.t - margin,
            r: self.r + margin,
            b: self.b + margin,
        }
    }

    /// Grows the box along a displacement so it also covers where the owner
    /// is about to move.
    pub fn extended_by(self, displacement: Vec2) -> Self {
        let mut out = self;
        if displacement.x < 0.0 {
            out.l += displacement.x;
        } else {
            out.r += displacement.x;
        }
        if displacement.y < 0.0 {
            out.t += displacement.y;
        } else {
            out.b += displacement.y;
        }
        out
    }

    pub fn intersects_circle(&self, center: Vec2, radius: f32) -> bool {
        let closest_x = center.x.clamp(self.l, self.r);
        let closest_y = center.y.clamp(self.t, self.b);
        let dx = center.x - closest_x;
        let dy = center.y - closest_y;
        dx * dx + dy * dy < radius * radius
    }
}
