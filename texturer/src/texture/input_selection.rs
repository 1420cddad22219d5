use std::collections::{HashMap, VecDeque};

use derive_more::{Add, AddAssign};
use image::imageops::{blur, grayscale};
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use kiddo::distance::squared_euclidean;
use kiddo::KdTree;
use log::{debug, info, warn};
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::camera::is_inside_with_border;
use crate::scene::View;
use crate::texture::*;

pub type GradientMap = ImageBuffer<Luma<f32>, Vec<f32>>;

// Equivalent to a 15x15 Gaussian kernel.
const GRADIENT_BLUR_SIGMA: f32 = 2.6;
const MIN_VIEW_ANGLE_COS: f64 = 0.001;
const INVALID_REGION_TOLERANCE: u8 = 3;

/// What a single view tells about a single face.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceData {
    pub view: usize,
    pub quality: f64,
    pub color: Vector3, // Mean color in YCbCr.
}

pub type FaceDataArr = Vec<FaceData>;

#[derive(Add, AddAssign, Default)]
struct PixelSum {
    quality: f64,
    color: Vector3,
    count: usize,
}

pub struct ViewImage {
    pub image: RgbImage,
    pub camera: Camera,
}

pub struct FaceViews {
    pub faces_datas: Vec<FaceDataArr>,
    pub images: Vec<Option<ViewImage>>, // Indexed by view.
}

/// Smoothed gradient magnitude of the gray image in [0, 1] units.
pub fn gradient_magnitude_map(image: &RgbImage) -> GradientMap {
    let gray = grayscale(image);
    let (w, h) = gray.dimensions();
    let g = |x: i64, y: i64| {
        let x = x.clamp(0, w as i64 - 1) as u32;
        let y = y.clamp(0, h as i64 - 1) as u32;
        gray.get_pixel(x, y)[0] as f32 / 255.0
    };
    let magnitude = GradientMap::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let gx = (g(x + 1, y - 1) + 2.0 * g(x + 1, y) + g(x + 1, y + 1)
            - g(x - 1, y - 1)
            - 2.0 * g(x - 1, y)
            - g(x - 1, y + 1))
            / 8.0;
        let gy = (g(x - 1, y + 1) + 2.0 * g(x, y + 1) + g(x + 1, y + 1)
            - g(x - 1, y - 1)
            - 2.0 * g(x, y - 1)
            - g(x + 1, y - 1))
            / 8.0;
        Luma([(gx * gx + gy * gy).sqrt()])
    });
    blur(&magnitude, GRADIENT_BLUR_SIGMA)
}

/// Marks as invalid (0) the black regions touching the image border, as
/// left by lens undistortion. Everything else is valid (255).
pub fn detect_invalid_regions(image: &RgbImage) -> GrayImage {
    let gray = grayscale(image);
    let (w, h) = gray.dimensions();
    let mut mask = GrayImage::from_pixel(w, h, Luma([255]));
    let seeds = [
        (0, 0),
        (w / 2, 0),
        (w - 1, 0),
        (w - 1, h / 2),
        (w - 1, h - 1),
        (w / 2, h - 1),
        (0, h - 1),
        (0, h / 2),
    ];

    let mut queue = VecDeque::new();
    for (sx, sy) in seeds {
        if gray.get_pixel(sx, sy)[0] != 0 || mask.get_pixel(sx, sy)[0] == 0 {
            continue;
        }
        mask.put_pixel(sx, sy, Luma([0]));
        queue.push_back((sx, sy));
        while let Some((x, y)) = queue.pop_front() {
            let v = gray.get_pixel(x, y)[0];
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let (nx, ny) = (nx as u32, ny as u32);
                    let n = gray.get_pixel(nx, ny)[0];
                    if mask.get_pixel(nx, ny)[0] != 0
                        && n >= v
                        && n <= v.saturating_add(INVALID_REGION_TOLERANCE)
                    {
                        mask.put_pixel(nx, ny, Luma([0]));
                        queue.push_back((nx, ny));
                    }
                }
            }
        }
    }

    mask
}

/// Mask of accepted pixels (non-zero) according to the ignore label:
/// `>= 0` rejects mask pixels equal to it, `-1` detects invalid regions and
/// `-2` (or anything lower) disables masking.
pub fn view_mask(
    view: &View,
    image: &RgbImage,
    ignore_label: i32,
) -> Result<Option<GrayImage>> {
    if ignore_label >= 0 {
        let (w, h) = image.dimensions();
        let mask = match view.load_mask(w, h)? {
            Some(mask) => mask,
            None => return Ok(None),
        };
        Ok(Some(GrayImage::from_fn(w, h, |x, y| {
            let label = mask.get_pixel(x, y)[0] as i32;
            Luma([if label == ignore_label { 0 } else { 255 }])
        })))
    } else if ignore_label == -1 {
        Ok(Some(detect_invalid_regions(image)))
    } else {
        Ok(None)
    }
}

/// Kd-tree over face centers used to cull faces outside a view frustum.
pub struct FaceIndex {
    tree: KdTree<f64, usize, 3>,
    max_face_radius: f64,
    bounds: [Point3; 2],
}

impl FaceIndex {
    pub fn new(mesh: &Mesh) -> Result<FaceIndex> {
        let mut tree = KdTree::new();
        for face_idx in 0..mesh.faces.len() {
            let c = mesh.face_center(face_idx);
            tree.add(c.coords.as_ref(), face_idx).map_err(|_| {
                let desc = format!("face {} has a non-finite center", face_idx);
                Error::new(MalformedData, desc)
            })?;
        }
        let mut bounds = [Point3::origin(); 2];
        if let Some(first) = mesh.vertices.first() {
            bounds = [*first; 2];
            for v in &mesh.vertices {
                bounds[0] = bounds[0].inf(v);
                bounds[1] = bounds[1].sup(v);
            }
        }
        Ok(FaceIndex {
            tree,
            max_face_radius: mesh.max_face_radius(),
            bounds,
        })
    }

    /// Faces whose centers may lie inside the frustum; a superset of the
    /// visible faces.
    pub fn faces_near_frustum(&self, camera: &Camera, size: [u32; 2]) -> Vec<usize> {
        if self.tree.size() == 0 {
            return vec![];
        }
        let [lo, hi] = self.bounds;
        let far = (0..8)
            .map(|i| {
                let corner = Point3::new(
                    if i & 1 == 0 { lo[0] } else { hi[0] },
                    if i & 2 == 0 { lo[1] } else { hi[1] },
                    if i & 4 == 0 { lo[2] } else { hi[2] },
                );
                camera.to_camera_space(&corner)[2]
            })
            .fold(f64::NEG_INFINITY, f64::max);
        if far <= 0.0 {
            return vec![];
        }

        let (w, h) = (size[0] as f64 - 0.5, size[1] as f64 - 0.5);
        let corners: Option<Vec<Point3>> = [(-0.5, -0.5), (w, -0.5), (-0.5, h), (w, h)]
            .iter()
            .map(|&(x, y)| camera.back_project(Vector2::new(x, y), far))
            .collect();
        let mut faces: Vec<usize> = match corners {
            Some(mut points) => {
                points.push(camera.c);
                let center = Point3::from(
                    points.iter().map(|p| p.coords).sum::<Vector3>()
                        / points.len() as f64,
                );
                let radius = points
                    .iter()
                    .map(|p| (p - center).norm())
                    .fold(0.0, f64::max)
                    + self.max_face_radius;
                self.tree
                    .within_unsorted(
                        center.coords.as_ref(),
                        radius * radius,
                        &squared_euclidean,
                    )
                    .map(|found| found.into_iter().map(|(_, &f)| f).collect())
                    .unwrap_or_default()
            }
            None => (0..self.tree.size()).collect(),
        };
        faces.sort_unstable();
        faces
    }
}

struct DepthMap {
    size: [u32; 2],
    depth: Vec<f64>,
    faces: Vec<Option<usize>>,
}

impl DepthMap {
    fn new(size: [u32; 2]) -> DepthMap {
        let n = size[0] as usize * size[1] as usize;
        DepthMap {
            size,
            depth: vec![0.0; n],
            faces: vec![None; n],
        }
    }

    fn idx(&self, x: u32, y: u32) -> usize {
        y as usize * self.size[0] as usize + x as usize
    }

    /// Z-buffer rasterization of one face. A masked-out pixel invalidates
    /// every pixel the face has won in this view, while the face still
    /// occludes what lies behind it.
    fn rasterize(
        &mut self,
        face_idx: usize,
        proj: &[ProjectedPoint; 3],
        mask: Option<&GrayImage>,
    ) {
        let tri = [proj[0].point, proj[1].point, proj[2].point];
        let inv_depth = Vector3::new(
            1.0 / proj[0].depth,
            1.0 / proj[1].depth,
            1.0 / proj[2].depth,
        );
        let mut rejected = false;
        rasterize_triangle(tri, self.size, |x, y, bary| {
            let z = 1.0 / bary.dot(&inv_depth);
            let i = self.idx(x, y);
            if self.depth[i] == 0.0 || self.depth[i] > z {
                self.depth[i] = z;
                let accepted = mask.map_or(true, |m| m.get_pixel(x, y)[0] != 0);
                rejected |= !accepted;
                self.faces[i] = if rejected { None } else { Some(face_idx) };
            }
        });
        if rejected {
            rasterize_triangle(tri, self.size, |x, y, _| {
                let i = self.idx(x, y);
                if self.faces[i] == Some(face_idx) {
                    self.faces[i] = None;
                }
            });
        }
    }
}

fn project_face(
    mesh: &Mesh,
    camera: &Camera,
    face_idx: usize,
    size: [u32; 2],
) -> Option<[ProjectedPoint; 3]> {
    let margin = (PATCH_BORDER + 1) as f64;
    let [v0, v1, v2] = mesh.faces[face_idx];
    let p = |v: usize| {
        camera
            .project(&mesh.vertices[v])
            .filter(|p| is_inside_with_border(&p.point, size, margin))
    };
    Some([p(v0)?, p(v1)?, p(v2)?])
}

/// Face data gathered from a single view, in increasing face order.
pub fn collect_view_face_datas(
    mesh: &Mesh,
    face_normals: &[Vector3],
    index: &FaceIndex,
    view_idx: usize,
    image: &RgbImage,
    camera: &Camera,
    mask: Option<&GrayImage>,
) -> Vec<(usize, FaceData)> {
    let size = [image.width(), image.height()];
    let mut depth_map = DepthMap::new(size);
    for face_idx in index.faces_near_frustum(camera, size) {
        if let Some(proj) = project_face(mesh, camera, face_idx, size) {
            depth_map.rasterize(face_idx, &proj, mask);
        }
    }

    let gradients = gradient_magnitude_map(image);
    let mut sums: HashMap<usize, PixelSum> = HashMap::new();
    for y in 0..size[1] {
        for x in 0..size[0] {
            if let Some(face_idx) = depth_map.faces[depth_map.idx(x, y)] {
                *sums.entry(face_idx).or_default() += PixelSum {
                    quality: gradients.get_pixel(x, y)[0] as f64,
                    color: get_pixel_as_vector3(x, y, image),
                    count: 1,
                };
            }
        }
    }

    let mut datas: Vec<(usize, FaceData)> = sums
        .into_iter()
        .map(|(face_idx, PixelSum { quality, color, count })| {
            let to_camera = (camera.c - mesh.face_center(face_idx))
                .try_normalize(f64::EPSILON)
                .unwrap_or_else(Vector3::zeros);
            let cos = face_normals[face_idx].dot(&to_camera).max(MIN_VIEW_ANGLE_COS);
            let data = FaceData {
                view: view_idx,
                quality: quality * cos * cos,
                color: rgb_to_ycbcr(color / count as f64),
            };
            (face_idx, data)
        })
        .collect();
    datas.sort_unstable_by_key(|(face_idx, _)| *face_idx);
    datas
}

/// Rasterizes the mesh into every selected view and returns the per-face
/// view data together with the loaded images.
pub fn list_camera_faces(
    mesh: &Mesh,
    face_normals: &[Vector3],
    views: &[View],
    view_idxs: &[usize],
    params: &TextureParams,
) -> Result<FaceViews> {
    info!("  rasterizing mesh faces into {} views...", view_idxs.len());
    let index = FaceIndex::new(mesh)?;

    let per_view = view_idxs
        .par_iter()
        .map(|&view_idx| {
            let view = &views[view_idx];
            let size = view.resolution(
                params.resolution_level,
                params.min_resolution,
                params.max_resolution,
            );
            let (image, camera) = view.load(size)?;
            let mask = view_mask(view, &image, params.ignore_mask_label)?;
            if params.ignore_mask_label >= 0 && mask.is_none() {
                warn!("    view {} has no mask to apply", view_idx);
            }
            let datas = collect_view_face_datas(
                mesh,
                face_normals,
                &index,
                view_idx,
                &image,
                &camera,
                mask.as_ref(),
            );
            debug!("    view {}: {} faces seen", view_idx, datas.len());
            Ok((view_idx, ViewImage { image, camera }, datas))
        })
        .collect::<Result<Vec<_>>>()?;

    // Merge in view order to keep face data deterministic.
    let mut faces_datas = vec![FaceDataArr::new(); mesh.faces.len()];
    let mut images: Vec<Option<ViewImage>> = views.iter().map(|_| None).collect();
    for (view_idx, view_image, datas) in per_view {
        for (face_idx, data) in datas {
            faces_datas[face_idx].push(data);
        }
        images[view_idx] = Some(view_image);
    }

    let num_seen = faces_datas.iter().filter(|d| !d.is_empty()).count();
    info!(
        "  {} of {} faces ({:.1}%) seen by at least one view",
        num_seen,
        mesh.faces.len(),
        100.0 * num_seen as f64 / mesh.faces.len().max(1) as f64
    );

    Ok(FaceViews {
        faces_datas,
        images,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::test::top_down_camera;
    use crate::mesh::test::quad_mesh;
    use crate::texture::test::*;
    use base::util::test::*;

    fn quad_datas(mesh: &Mesh, camera: &Camera, image: &RgbImage, mask: Option<&GrayImage>) -> Vec<(usize, FaceData)> {
        let index = FaceIndex::new(mesh).unwrap();
        collect_view_face_datas(mesh, &mesh.face_normals(), &index, 0, image, camera, mask)
    }

    #[test]
    fn test_gradient_magnitude_map() {
        let flat = gradient_magnitude_map(&flat_image(20, 20, [50, 50, 50]));
        assert!(flat.pixels().all(|p| p[0].abs() < 1e-6));
        let board = gradient_magnitude_map(&checkerboard(20, 20, 4, 0, 255));
        assert!(board.pixels().any(|p| p[0] > 0.05));
    }

    #[test]
    fn test_detect_invalid_regions() {
        let mut image = flat_image(10, 10, [120, 120, 120]);
        for y in 0..10 {
            image.put_pixel(0, y, image::Rgb([0, 0, 0]));
            image.put_pixel(1, y, image::Rgb([1, 1, 1]));
        }
        // Isolated black pixel inside the image stays valid.
        image.put_pixel(5, 5, image::Rgb([0, 0, 0]));
        let mask = detect_invalid_regions(&image);
        for y in 0..10 {
            assert_eq!(mask.get_pixel(0, y)[0], 0);
            assert_eq!(mask.get_pixel(1, y)[0], 0);
            assert_eq!(mask.get_pixel(2, y)[0], 255);
        }
        assert_eq!(mask.get_pixel(5, 5)[0], 255);
    }

    #[test]
    fn test_both_quad_faces_seen() {
        let (mesh, views) = two_view_quad_scene();
        let (image, camera) = views[0].load(VIEW_SIZE).unwrap();
        let datas = quad_datas(&mesh, &camera, &image, None);
        assert_eq!(datas.len(), 2);
        for (face_idx, (f, data)) in datas.iter().enumerate() {
            assert_eq!(*f, face_idx);
            assert_eq!(data.view, 0);
            assert!(data.quality > 0.0);
        }
    }

    #[test]
    fn test_occluded_face_is_not_seen() {
        let mut mesh = quad_mesh();
        // A smaller copy of the quad below the first one.
        for i in 0..4 {
            let v = mesh.vertices[i];
            mesh.vertices.push(Point3::new(0.25 + v[0] * 0.5, 0.25 + v[1] * 0.5, -1.0));
        }
        mesh.faces.push([4, 5, 6]);
        mesh.faces.push([4, 6, 7]);
        let camera = top_down_camera(Point3::new(0.5, 0.5, 2.0), 100.0, VIEW_SIZE);
        let image = checkerboard(VIEW_SIZE, VIEW_SIZE, 4, 0, 255);
        let datas = quad_datas(&mesh, &camera, &image, None);
        let faces: Vec<usize> = datas.iter().map(|(f, _)| *f).collect();
        assert_eq!(faces, vec![0, 1]);
    }

    #[test]
    fn test_mask_invalidates_whole_face() {
        let (mesh, views) = two_view_quad_scene();
        let (image, camera) = views[0].load(VIEW_SIZE).unwrap();
        // Face 0 covers the lower right half of the projected quad.
        let mut mask = GrayImage::from_pixel(VIEW_SIZE, VIEW_SIZE, Luma([255]));
        mask.put_pixel(70, 70, Luma([0]));
        let datas = quad_datas(&mesh, &camera, &image, Some(&mask));
        let faces: Vec<usize> = datas.iter().map(|(f, _)| *f).collect();
        assert_eq!(faces.len(), 1);
    }

    #[test]
    fn test_oblique_view_has_lower_quality() {
        let (mesh, _) = two_view_quad_scene();
        let image = checkerboard(VIEW_SIZE, VIEW_SIZE, 4, 0, 255);
        let front = top_down_camera(Point3::new(0.5, 0.5, 2.0), 100.0, VIEW_SIZE);
        let mut oblique = front.clone();
        let angle: f64 = 0.5;
        let rot = nalgebra::Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
        oblique.r = front.r * rot.matrix().transpose();
        oblique.c = Point3::new(0.5, 0.5, 0.0) + rot * Vector3::new(0.0, 0.0, 2.0);
        let q = |camera: &Camera| {
            quad_datas(&mesh, camera, &image, None)
                .iter()
                .map(|(_, d)| d.quality)
                .sum::<f64>()
        };
        assert!(q(&oblique) < q(&front));
    }

    #[test]
    fn test_faces_near_frustum() {
        let mut mesh = quad_mesh();
        mesh.vertices.push(Point3::new(50.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(51.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(51.0, 1.0, 0.0));
        mesh.faces.push([4, 5, 6]);
        let index = FaceIndex::new(&mesh).unwrap();
        let camera = top_down_camera(Point3::new(0.5, 0.5, 2.0), 100.0, VIEW_SIZE);
        assert_eq!(index.faces_near_frustum(&camera, [VIEW_SIZE, VIEW_SIZE]), vec![0, 1]);
        let behind = top_down_camera(Point3::new(0.5, 0.5, -2.0), 100.0, VIEW_SIZE);
        assert!(index.faces_near_frustum(&behind, [VIEW_SIZE, VIEW_SIZE]).is_empty());
    }
}
