use std::collections::HashMap;

use image::{Rgb, Rgb32FImage};
use log::{debug, info};
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::texture::*;

type CooMatrix = nalgebra_sparse::coo::CooMatrix<f64>;
type CsrMatrix = nalgebra_sparse::csr::CsrMatrix<f64>;
type DVector = nalgebra::DVector<f64>;

const REGULARIZATION_WEIGHT: f64 = 0.1;
const SOLVER_TOLERANCE: f64 = 1e-4;
const SOLVER_MAX_ITERATIONS: usize = 1000;

/// Weighted mean of YCbCr colors sampled along seam edges.
#[derive(Default)]
struct EdgeSampler {
    sum: Vector3,
    weight: f64,
}

impl EdgeSampler {
    fn add_edge(&mut self, p0: Vector2, p1: Vector2, image: &RgbImage) {
        let d = p1 - p0;
        let length = d.norm();
        let num_samples = ((length.max(1.0) * 2.0).round() as usize).saturating_sub(1).max(1);
        let mut sum = Vector3::zeros();
        let mut weight = 0.0;
        for s in 0..num_samples {
            let t = s as f64 / num_samples as f64;
            let color = rgb_to_ycbcr(sample_pixel(p0 + d * t, image));
            sum += color * (1.0 - t);
            weight += 1.0 - t;
        }
        if weight > 0.0 {
            self.sum += sum / weight * length;
            self.weight += length;
        }
    }

    fn color(&self) -> Option<Vector3> {
        if self.weight > 0.0 {
            Some(self.sum / self.weight)
        } else {
            None
        }
    }
}

/// Mean color of a patch around a seam vertex, sampled along the seam
/// edges leaving it.
pub fn seam_vertex_color(
    seams: &SeamVertices,
    seam: &SeamVertex,
    patch: usize,
    image: &RgbImage,
) -> Option<Vector3> {
    let seam_patch = seam.patch(patch)?;
    let mut sampler = EdgeSampler::default();
    for edge in &seam_patch.edges {
        let (_, other) = seams.get_index(edge.other)?;
        if let Some(other_patch) = other.patch(patch) {
            sampler.add_edge(seam_patch.proj, other_patch.proj, image);
        }
    }
    sampler.color()
}

fn conjugate_gradients_solve(a: &CsrMatrix, b: &DVector) -> Result<DVector> {
    // Jacobi preconditioned CG for a symmetric positive semi-definite `a`.
    let n = b.nrows();
    let mut inv_diag = DVector::from_element(n, 1.0);
    for (row, col, &v) in a.triplet_iter() {
        if row == col && v > 0.0 {
            inv_diag[row] = 1.0 / v;
        }
    }

    let b_norm = b.norm();
    let mut x = DVector::zeros(n);
    if b_norm == 0.0 {
        return Ok(x);
    }
    let mut r = b.clone();
    let mut z = r.component_mul(&inv_diag);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    for iteration in 0..SOLVER_MAX_ITERATIONS {
        let ap = a * &p;
        let alpha = rz / p.dot(&ap);
        x += alpha * &p;
        r -= alpha * ap;
        let residual = r.norm() / b_norm;
        if residual < SOLVER_TOLERANCE {
            debug!("    conjugate gradients: {} iterations, residual {:e}", iteration + 1, residual);
            return Ok(x);
        }
        z = r.component_mul(&inv_diag);
        let rz_new = r.dot(&z);
        p = &z + (rz_new / rz) * p;
        rz = rz_new;
    }
    Err(Error::new(
        SolverFailure,
        format!(
            "seam leveling did not converge in {} iterations",
            SOLVER_MAX_ITERATIONS
        ),
    ))
}

/// Piecewise linear per-patch color correction defined at the vertices of
/// every patch, smooth inside patches and closing the color gaps on seams.
pub struct ColorCorrection {
    rows: HashMap<(usize, usize), usize>, // (vertex, patch) -> unknown
    corrections: Vec<Vector3>,
}

// Adds the normal equations of the row `w * (x[c0] - x[c1]) = b`.
fn push_difference_row(
    lhs: &mut CooMatrix,
    rhs: &mut [Vector3],
    c0: usize,
    c1: usize,
    w: f64,
    b: Vector3,
) {
    let w2 = w * w;
    lhs.push(c0, c0, w2);
    lhs.push(c1, c1, w2);
    lhs.push(c0, c1, -w2);
    lhs.push(c1, c0, -w2);
    rhs[c0] += w * b;
    rhs[c1] -= w * b;
}

impl ColorCorrection {
    pub fn new(
        mesh: &Mesh,
        patched: &PatchedMesh,
        seams: &SeamVertices,
    ) -> Result<ColorCorrection> {
        let reserved = patched.reserved_patch();
        let mut rows = HashMap::new();
        for (patch_idx, patch) in patched.patches[..reserved].iter().enumerate() {
            for &face_idx in &patch.faces {
                for &v in &mesh.faces[face_idx] {
                    let next = rows.len();
                    rows.entry((v, patch_idx)).or_insert(next);
                }
            }
        }
        let n = rows.len();
        let mut lhs = CooMatrix::new(n, n);
        let mut rhs = vec![Vector3::zeros(); n];

        // Smoothness of the correction inside each patch.
        let mut patch_edges = std::collections::HashSet::new();
        for (patch_idx, patch) in patched.patches[..reserved].iter().enumerate() {
            for &face_idx in &patch.faces {
                let face = mesh.faces[face_idx];
                for k in 0..3 {
                    let e = ordered([face[k], face[(k + 1) % 3]]);
                    if patch_edges.insert((e, patch_idx)) {
                        let (c0, c1) = (rows[&(e[0], patch_idx)], rows[&(e[1], patch_idx)]);
                        push_difference_row(
                            &mut lhs,
                            &mut rhs,
                            c0,
                            c1,
                            REGULARIZATION_WEIGHT,
                            Vector3::zeros(),
                        );
                    }
                }
            }
        }

        // Color differences between the patches meeting at seam vertices.
        let mut num_constraints = 0;
        for seam in seams.values() {
            if seam.patches.len() < 2 {
                continue;
            }
            let mut colors: Vec<(usize, Vector3)> = seam
                .patches
                .iter()
                .filter_map(|p| {
                    let image = &patched.patch_images[p.patch];
                    seam_vertex_color(seams, seam, p.patch, image).map(|c| (p.patch, c))
                })
                .collect();
            colors.sort_by_key(|(patch, _)| *patch);
            for i in 0..colors.len() {
                for j in i + 1..colors.len() {
                    let (p0, color0) = colors[i];
                    let (p1, color1) = colors[j];
                    let c0 = rows[&(seam.vertex, p0)];
                    let c1 = rows[&(seam.vertex, p1)];
                    push_difference_row(&mut lhs, &mut rhs, c0, c1, 1.0, color1 - color0);
                    num_constraints += 1;
                }
            }
        }
        info!(
            "  solving for {} color corrections with {} seam constraints...",
            n, num_constraints
        );

        let lhs = CsrMatrix::from(&lhs);
        let solutions = (0..3)
            .into_par_iter()
            .map(|channel| {
                let b = DVector::from_iterator(n, rhs.iter().map(|c| c[channel]));
                let x = conjugate_gradients_solve(&lhs, &b)?;
                let mean = if n > 0 { x.mean() } else { 0.0 };
                Ok(x.add_scalar(-mean))
            })
            .collect::<Result<Vec<DVector>>>()?;
        let corrections = (0..n)
            .map(|i| Vector3::new(solutions[0][i], solutions[1][i], solutions[2][i]))
            .collect();
        Ok(ColorCorrection { rows, corrections })
    }

    pub fn vertex_correction(&self, vertex: usize, patch: usize) -> Vector3 {
        self.rows
            .get(&(vertex, patch))
            .map_or_else(Vector3::zeros, |&row| self.corrections[row])
    }

    /// Correction image of a patch in YCbCr units, grown by one pixel.
    pub fn rasterize(&self, mesh: &Mesh, patched: &PatchedMesh, patch_idx: usize) -> Rgb32FImage {
        let patch = &patched.patches[patch_idx];
        let size = patch.rect.size;
        let mut image = Rgb32FImage::new(size[0], size[1]);
        for &face_idx in &patch.faces {
            let [v0, v1, v2] = mesh.faces[face_idx];
            let colors = [
                self.vertex_correction(v0, patch_idx),
                self.vertex_correction(v1, patch_idx),
                self.vertex_correction(v2, patch_idx),
            ];
            rasterize_triangle(patched.uv_coords[face_idx], size, |x, y, bary| {
                let c = colors[0] * bary[0] + colors[1] * bary[1] + colors[2] * bary[2];
                image.put_pixel(x, y, Rgb([c[0] as f32, c[1] as f32, c[2] as f32]));
            });
        }
        dilate_mean(&image)
    }
}

/// Fills every zero pixel having non-zero 8-neighbours with their mean.
fn dilate_mean(image: &Rgb32FImage) -> Rgb32FImage {
    let (w, h) = image.dimensions();
    let is_zero = |p: &Rgb<f32>| p.0 == [0.0; 3];
    let mut out = image.clone();
    for y in 0..h {
        for x in 0..w {
            if !is_zero(image.get_pixel(x, y)) {
                continue;
            }
            let mut sum = [0.0f32; 3];
            let mut count = 0;
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let p = image.get_pixel(nx, ny);
                    if !is_zero(p) {
                        for c in 0..3 {
                            sum[c] += p[c];
                        }
                        count += 1;
                    }
                }
            }
            if count > 0 {
                out.put_pixel(x, y, Rgb(sum.map(|s| s / count as f32)));
            }
        }
    }
    out
}

/// Low-frequency leveling: shifts the colors of whole patches so that they
/// agree along their seams.
pub fn level_seams_globally(
    mesh: &Mesh,
    patched: &mut PatchedMesh,
    seams: &SeamVertices,
) -> Result<()> {
    info!("  leveling seams globally...");
    let correction = ColorCorrection::new(mesh, patched, seams)?;
    let reserved = patched.reserved_patch();
    let adjustments: Vec<Rgb32FImage> = (0..reserved)
        .into_par_iter()
        .map(|patch_idx| correction.rasterize(mesh, patched, patch_idx))
        .collect();
    patched.patch_images[..reserved]
        .par_iter_mut()
        .zip(adjustments)
        .for_each(|(image, adjustment)| {
            for (x, y, a) in adjustment.enumerate_pixels() {
                if a.0 == [0.0; 3] {
                    continue;
                }
                let a = Vector3::new(a[0] as f64, a[1] as f64, a[2] as f64);
                let color = get_pixel_as_vector3(x, y, image);
                set_pixel_as_vector3(x, y, ycbcr_to_rgb(rgb_to_ycbcr(color) + a), image);
            }
        });
    Ok(())
}
