use crate::mesh::{Point3, Vector3};

pub type Matrix3 = nalgebra::Matrix3<f64>;
pub type Vector2 = nalgebra::Vector2<f64>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectedPoint {
    pub point: Vector2,
    pub depth: f64,
}

/// Pinhole camera: `x = K * R * (X - C)`. Pixel centers sit at integer
/// coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Camera {
    pub k: Matrix3,
    pub r: Matrix3,
    pub c: Point3,
}

impl Camera {
    pub fn to_camera_space(&self, p: &Point3) -> Vector3 {
        self.r * (p - self.c)
    }

    /// Projects a world point; `None` if it lies behind the camera.
    pub fn project(&self, p: &Point3) -> Option<ProjectedPoint> {
        let x = self.to_camera_space(p);
        if x[2] <= 0.0 {
            return None;
        }
        let h = self.k * x;
        Some(ProjectedPoint {
            point: Vector2::new(h[0] / h[2], h[1] / h[2]),
            depth: x[2],
        })
    }

    /// World point seen at `pixel` with camera-space depth `depth`.
    pub fn back_project(&self, pixel: Vector2, depth: f64) -> Option<Point3> {
        let k_inv = self.k.try_inverse()?;
        let ray = k_inv * Vector3::new(pixel[0], pixel[1], 1.0);
        if ray[2].abs() < f64::EPSILON {
            return None;
        }
        Some(self.c + self.r.transpose() * (ray * (depth / ray[2])))
    }

    /// Camera for the same view rendered at a different image size.
    pub fn scaled(&self, sx: f64, sy: f64) -> Camera {
        let mut k = self.k;
        k[(0, 0)] *= sx;
        k[(0, 1)] *= sx;
        k[(0, 2)] = (k[(0, 2)] + 0.5) * sx - 0.5;
        k[(1, 1)] *= sy;
        k[(1, 2)] = (k[(1, 2)] + 0.5) * sy - 0.5;
        Camera {
            k,
            r: self.r,
            c: self.c,
        }
    }
}

pub fn is_inside_with_border(p: &Vector2, size: [u32; 2], border: f64) -> bool {
    p[0] >= border
        && p[1] >= border
        && p[0] < size[0] as f64 - 1.0 - border
        && p[1] < size[1] as f64 - 1.0 - border
}
