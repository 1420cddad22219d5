// Imports, typedefs and simple functionality shared by all stages of the
// mesh texturing process.

mod color_correction;
mod face_outliers;
mod inference;
mod input_patching;
mod input_selection;
mod output_baking;
mod output_packing;
mod output_patching;
mod poisson_blending;
mod seam_vertices;
mod textured_mesh;
mod view_selection;
mod virtual_faces;

use std::cmp::Ordering;
use std::ops::Add;

use image::{Rgb, Rgb32FImage, RgbImage};

pub use crate::camera::{Camera, ProjectedPoint};
pub use crate::mesh::{ordered, shared_edge, Mesh, MeshTopology};
pub use crate::texture::{
    color_correction::*, face_outliers::*, inference::*, input_patching::*,
    input_selection::*, output_baking::*, output_packing::*,
    output_patching::*, poisson_blending::*, seam_vertices::*,
    textured_mesh::*, view_selection::*, virtual_faces::*,
};

pub type Vector3 = nalgebra::Vector3<f64>;
pub type Point3 = nalgebra::Point3<f64>;
pub type Vector2 = nalgebra::Vector2<f64>;
pub type Matrix2 = nalgebra::Matrix2<f64>;
pub type Matrix3 = nalgebra::Matrix3<f64>;

/// Pixels added around the projection of every texture patch.
pub const PATCH_BORDER: u32 = 2;

pub fn get_pixel_as_vector3(x: u32, y: u32, image: &RgbImage) -> Vector3 {
    let p = image.get_pixel(x, y);
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

pub fn set_pixel_as_vector3(x: u32, y: u32, color: Vector3, image: &mut RgbImage) {
    let c = |v: f64| v.clamp(0.0, 255.0).round() as u8;
    image.put_pixel(x, y, Rgb([c(color[0]), c(color[1]), c(color[2])]));
}

/// Bilinear sample at pixel coordinates, clamped to the image.
pub fn sample_pixel(p: Vector2, image: &RgbImage) -> Vector3 {
    let (w, h) = image.dimensions();
    let x = p[0].clamp(0.0, (w - 1) as f64);
    let y = p[1].clamp(0.0, (h - 1) as f64);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (dx, dy) = (x - x0 as f64, y - y0 as f64);
    let s00 = get_pixel_as_vector3(x0, y0, image);
    let s10 = get_pixel_as_vector3(x1, y0, image);
    let s01 = get_pixel_as_vector3(x0, y1, image);
    let s11 = get_pixel_as_vector3(x1, y1, image);
    let s0 = (1.0 - dx) * s00 + dx * s10;
    let s1 = (1.0 - dx) * s01 + dx * s11;
    (1.0 - dy) * s0 + dy * s1
}

pub fn sample_pixel_f32(p: Vector2, image: &Rgb32FImage) -> Vector3 {
    let (w, h) = image.dimensions();
    let x = p[0].clamp(0.0, (w - 1) as f64);
    let y = p[1].clamp(0.0, (h - 1) as f64);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (dx, dy) = (x - x0 as f64, y - y0 as f64);
    let get = |x, y| {
        let p = image.get_pixel(x, y);
        Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
    };
    let s0 = (1.0 - dx) * get(x0, y0) + dx * get(x1, y0);
    let s1 = (1.0 - dx) * get(x0, y1) + dx * get(x1, y1);
    (1.0 - dy) * s0 + dy * s1
}

// JPEG (full range) luma/chroma transform.

pub fn rgb_to_ycbcr(c: Vector3) -> Vector3 {
    Vector3::new(
        0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2],
        -0.168736 * c[0] - 0.331264 * c[1] + 0.5 * c[2] + 128.0,
        0.5 * c[0] - 0.418688 * c[1] - 0.081312 * c[2] + 128.0,
    )
}

pub fn ycbcr_to_rgb(c: Vector3) -> Vector3 {
    let (cb, cr) = (c[1] - 128.0, c[2] - 128.0);
    Vector3::new(
        c[0] + 1.402 * cr,
        c[0] - 0.34414 * cb - 0.71414 * cr,
        c[0] + 1.772 * cb,
    )
}

pub struct BarycentricCoordinateSystem {
    origin: Vector2,
    inv: Matrix2,
    vs: [Vector2; 3],
}

impl BarycentricCoordinateSystem {
    pub fn new(vs: [Vector2; 3]) -> Option<Self> {
        let m22 = Matrix2::from_columns(&[vs[1] - vs[0], vs[2] - vs[0]]);
        // None when the triangle is degenerate.
        let inv = m22.try_inverse()?;
        Some(Self {
            origin: vs[0],
            inv,
            vs,
        })
    }

    // The functions 'infer' and 'apply' are mutually inverse.

    pub fn infer(&self, v: Vector2) -> Vector3 {
        let l = self.inv * (v - self.origin);
        Vector3::new(1.0 - l[0] - l[1], l[0], l[1])
    }

    // Assuming the input 'u' sums to 1.0.
    pub fn apply(&self, u: Vector3) -> Vector2 {
        u[0] * self.vs[0] + u[1] * self.vs[1] + u[2] * self.vs[2]
    }
}

const INSIDE_EPS: f64 = 1e-9;

/// Calls `f(x, y, barycentric)` for every pixel whose center lies inside
/// the triangle and within an image of the given size.
pub fn rasterize_triangle<F: FnMut(u32, u32, Vector3)>(
    tri: [Vector2; 3],
    size: [u32; 2],
    mut f: F,
) {
    let system = match BarycentricCoordinateSystem::new(tri) {
        Some(system) => system,
        None => return,
    };
    if size[0] == 0 || size[1] == 0 {
        return;
    }
    let coord = |k: usize| tri.iter().map(move |v| v[k]);
    let lo = |k: usize| extremum(coord(k), Iterator::min_by).ceil().max(0.0);
    let hi = |k: usize| {
        extremum(coord(k), Iterator::max_by)
            .floor()
            .min((size[k] - 1) as f64)
    };
    let (x0, x1, y0, y1) = (lo(0), hi(0), lo(1), hi(1));
    if x0 > x1 || y0 > y1 {
        return;
    }
    for y in y0 as u32..=y1 as u32 {
        for x in x0 as u32..=x1 as u32 {
            let bary = system.infer(Vector2::new(x as f64, y as f64));
            if bary.iter().all(|&c| c >= -INSIDE_EPS) {
                f(x, y, bary);
            }
        }
    }
}

/// Calls `f(x, y)` for the pixels on the segment between two points.
pub fn draw_line<F: FnMut(i64, i64)>(p0: Vector2, p1: Vector2, mut f: F) {
    let d = p1 - p0;
    let steps = d[0].abs().max(d[1].abs()).ceil().max(1.0) as usize;
    let mut last = None;
    for i in 0..=steps {
        let p = p0 + d * (i as f64 / steps as f64);
        let pt = (p[0].round() as i64, p[1].round() as i64);
        if last != Some(pt) {
            f(pt.0, pt.1);
            last = Some(pt);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Rectangle<T> {
    pub pos: [T; 2], // x, y
    pub size: [T; 2],
}

type Comparator<T> = fn(&T, &T) -> Ordering;

pub fn extremum<T: Copy + PartialOrd, I: Iterator<Item = T>>(
    it: I,
    f: fn(I, Comparator<T>) -> Option<T>,
) -> T {
    f(it, |p, q| p.partial_cmp(q).unwrap_or(Ordering::Equal))
        .expect("extremum of an empty sequence")
}

impl<T> Rectangle<T>
where
    T: Copy + PartialOrd + Add<Output = T>,
{
    pub fn new(x: T, y: T, width: T, height: T) -> Self {
        Rectangle {
            pos: [x, y],
            size: [width, height],
        }
    }

    pub fn end(&self) -> [T; 2] {
        [self.pos[0] + self.size[0], self.pos[1] + self.size[1]]
    }

    pub fn contains(&self, other: &Rectangle<T>) -> bool {
        let (e, f) = (self.end(), other.end());
        self.pos[0] <= other.pos[0]
            && self.pos[1] <= other.pos[1]
            && f[0] <= e[0]
            && f[1] <= e[1]
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::camera::test::top_down_camera;
    use crate::mesh::test::quad_mesh;
    use crate::scene::View;
    use base::util::test::*;

    pub const VIEW_SIZE: u32 = 101;

    /// Unit quad seen from above by two cameras; the first one sees a
    /// high-contrast checkerboard, the second one a low-contrast one.
    pub fn two_view_quad_scene() -> (Mesh, Vec<View>) {
        let mesh = quad_mesh();
        let views = vec![
            View::new(
                top_down_camera(Point3::new(0.5, 0.5, 2.0), 100.0, VIEW_SIZE),
                checkerboard(VIEW_SIZE, VIEW_SIZE, 4, 20, 230),
            ),
            View::new(
                top_down_camera(Point3::new(0.6, 0.5, 2.0), 100.0, VIEW_SIZE),
                checkerboard(VIEW_SIZE, VIEW_SIZE, 4, 100, 140),
            ),
        ];
        (mesh, views)
    }

    #[test]
    fn test_ycbcr_conversion() {
        let c = Vector3::new(200.0, 30.0, 90.0);
        let back = ycbcr_to_rgb(rgb_to_ycbcr(c));
        assert!((c - back).norm() < 1e-2);
        let gray = rgb_to_ycbcr(Vector3::new(77.0, 77.0, 77.0));
        assert_eq_f64!(gray[0], 77.0, 1e-9);
        assert_eq_f64!(gray[1], 128.0, 1e-9);
        assert_eq_f64!(gray[2], 128.0, 1e-9);
    }

    #[test]
    fn test_sample_pixel() {
        let mut image = flat_image(2, 2, [0, 0, 0]);
        image.put_pixel(1, 0, Rgb([100, 100, 100]));
        let c = sample_pixel(Vector2::new(0.5, 0.0), &image);
        assert_eq_f64!(c[0], 50.0);
        let c = sample_pixel(Vector2::new(0.5, 0.5), &image);
        assert_eq_f64!(c[0], 25.0);
        let c = sample_pixel(Vector2::new(7.0, -3.0), &image);
        assert_eq_f64!(c[0], 100.0);
    }

    #[test]
    fn test_barycentric_coordinates() {
        let tri = [
            Vector2::new(1.0, 1.0),
            Vector2::new(5.0, 1.0),
            Vector2::new(1.0, 4.0),
        ];
        let system = BarycentricCoordinateSystem::new(tri).unwrap();
        let p = Vector2::new(2.0, 2.0);
        let u = system.infer(p);
        assert_eq_f64!(u.sum(), 1.0);
        assert!((system.apply(u) - p).norm() < 1e-12);
        assert!(BarycentricCoordinateSystem::new([tri[0]; 3]).is_none());
    }

    #[test]
    fn test_rasterize_triangle() {
        let tri = [
            Vector2::new(0.0, 0.0),
            Vector2::new(4.0, 0.0),
            Vector2::new(0.0, 4.0),
        ];
        let mut count = 0;
        rasterize_triangle(tri, [10, 10], |x, y, bary| {
            assert!(x + y <= 4);
            assert!(bary.iter().all(|&c| c >= -1e-9));
            count += 1;
        });
        assert_eq!(count, 15);
        let mut clipped = 0;
        rasterize_triangle(tri, [2, 2], |_, _, _| clipped += 1);
        assert_eq!(clipped, 4);
    }

    #[test]
    fn test_draw_line() {
        let mut pts = vec![];
        draw_line(Vector2::new(0.0, 0.0), Vector2::new(3.0, 1.0), |x, y| {
            pts.push((x, y))
        });
        assert_eq!(pts.first(), Some(&(0, 0)));
        assert_eq!(pts.last(), Some(&(3, 1)));
        assert_eq!(pts.len(), 4);
    }

    #[test]
    fn test_rectangles() {
        let outer = Rectangle::new(0u32, 0, 10, 10);
        let inner = Rectangle::new(2u32, 3, 4, 5);
        assert!(outer.contains(&inner) && !inner.contains(&outer));
        assert_eq!(inner.end(), [6, 8]);
        assert!(!outer.contains(&Rectangle::new(8, 8, 3, 1)));
    }
}
