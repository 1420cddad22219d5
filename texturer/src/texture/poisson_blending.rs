use std::collections::HashSet;

use image::{GrayImage, Luma, Rgb, Rgb32FImage};
use log::info;
use nalgebra_sparse::factorization::CscCholesky;
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::texture::*;

type CooMatrix = nalgebra_sparse::coo::CooMatrix<f64>;
type CscMatrix = nalgebra_sparse::csc::CscMatrix<f64>;
type DMatrix = nalgebra::DMatrix<f64>;

pub const MASK_EMPTY: u8 = 0;
pub const MASK_BORDER: u8 = 128;
pub const MASK_INTERIOR: u8 = 255;

const STRIP_WIDTH: usize = 20;

fn mask_at(mask: &GrayImage, x: i64, y: i64) -> u8 {
    let (w, h) = mask.dimensions();
    if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
        MASK_EMPTY
    } else {
        mask.get_pixel(x as u32, y as u32)[0]
    }
}

fn non_empty_neighbours(mask: &GrayImage, x: u32, y: u32) -> Vec<(u32, u32)> {
    let mut found = vec![];
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if (dx, dy) != (0, 0) && mask_at(mask, nx, ny) != MASK_EMPTY {
                found.push((nx as u32, ny as u32));
            }
        }
    }
    found
}

/// Turns a coverage mask with rendered seam lines into a strip of interior
/// pixels along the patch outline, closed by a continuous one pixel border
/// on both sides. Everything deeper than `strip_width` becomes empty.
pub fn process_mask(mask: &mut GrayImage, strip_width: usize) {
    let (w, h) = mask.dimensions();
    let get = |m: &GrayImage, x: u32, y: u32| m.get_pixel(x, y)[0];

    // Close gaps between the rasterized faces and the seam lines.
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            if get(mask, x, y) != MASK_BORDER {
                continue;
            }
            for (nx, ny) in [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)] {
                if get(mask, nx, ny) != MASK_BORDER {
                    mask.put_pixel(nx, ny, Luma([MASK_INTERIOR]));
                }
            }
        }
    }

    // Drop interior pixels leaking outside of the seam lines.
    for y in 0..h {
        for x in 0..w {
            if get(mask, x, y) != MASK_INTERIOR {
                continue;
            }
            for (dx, dy) in [(1i64, 0i64), (0, 1), (1, 1), (1, -1)] {
                let l = mask_at(mask, x as i64 - dx, y as i64 - dy);
                let r = mask_at(mask, x as i64 + dx, y as i64 + dy);
                if (l == MASK_BORDER && r == MASK_EMPTY) || (r == MASK_BORDER && l == MASK_EMPTY) {
                    mask.put_pixel(x, y, Luma([MASK_EMPTY]));
                    break;
                }
            }
        }
    }

    // Interior pixels touching the outside become border.
    for y in 0..h {
        for x in 0..w {
            if get(mask, x, y) != MASK_INTERIOR {
                continue;
            }
            let (xi, yi) = (x as i64, y as i64);
            if [(xi - 1, yi), (xi + 1, yi), (xi, yi - 1), (xi, yi + 1)]
                .iter()
                .any(|&(nx, ny)| mask_at(mask, nx, ny) == MASK_EMPTY)
            {
                mask.put_pixel(x, y, Luma([MASK_BORDER]));
            }
        }
    }

    // Peel the patch outline inwards to find the inner edge of the strip.
    let mut outline: HashSet<(u32, u32)> = HashSet::new();
    for y in 0..h {
        for x in 0..w {
            if get(mask, x, y) == MASK_EMPTY {
                continue;
            }
            let on_edge = x == 0 || y == 0 || x == w - 1 || y == h - 1;
            let near_empty = (-1i64..=1).any(|dy| {
                (-1i64..=1).any(|dx| mask_at(mask, x as i64 + dx, y as i64 + dy) == MASK_EMPTY)
            });
            if on_edge || near_empty {
                outline.insert((x, y));
            }
        }
    }
    let mut peeled = mask.clone();
    for _ in 0..strip_width {
        let removed: Vec<(u32, u32)> = outline.drain().collect();
        for &(x, y) in &removed {
            peeled.put_pixel(x, y, Luma([MASK_EMPTY]));
        }
        for &(x, y) in &removed {
            outline.extend(non_empty_neighbours(&peeled, x, y));
        }
    }
    for (x, y, p) in peeled.enumerate_pixels() {
        if p[0] != MASK_EMPTY {
            mask.put_pixel(x, y, Luma([MASK_EMPTY]));
        }
    }
    for (x, y) in outline {
        mask.put_pixel(x, y, Luma([MASK_BORDER]));
    }
}

fn pixel(image: &Rgb32FImage, x: u32, y: u32) -> Vector3 {
    let p = image.get_pixel(x, y);
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

/// Solves the Poisson equation over the interior pixels of `mask`: the
/// result keeps the Laplacian of `src` and matches `dst` on border pixels.
/// Interior pixels of `dst` are overwritten.
pub fn poisson_blend(src: &Rgb32FImage, dst: &mut Rgb32FImage, mask: &GrayImage) -> Result<()> {
    let (w, h) = mask.dimensions();
    let mut unknowns = vec![usize::MAX; (w * h) as usize];
    let mut interior = vec![];
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == MASK_INTERIOR {
            unknowns[(y * w + x) as usize] = interior.len();
            interior.push((x, y));
        }
    }
    let n = interior.len();
    if n == 0 {
        return Ok(());
    }

    let mut coo = CooMatrix::new(n, n);
    let mut rhs = DMatrix::zeros(n, 3);
    for (row, &(x, y)) in interior.iter().enumerate() {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            return Err(Error::new(
                InconsistentState,
                format!("interior blending pixel ({}, {}) on the patch edge", x, y),
            ));
        }
        coo.push(row, row, 4.0);
        let mut b = 4.0 * pixel(src, x, y);
        for (nx, ny) in [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)] {
            b -= pixel(src, nx, ny);
            match unknowns[(ny * w + nx) as usize] {
                usize::MAX => b += pixel(dst, nx, ny),
                col => coo.push(row, col, -1.0),
            }
        }
        for c in 0..3 {
            rhs[(row, c)] = b[c];
        }
    }

    let a = CscMatrix::from(&coo);
    let cholesky = CscCholesky::factor(&a).map_err(|e| {
        Error::new(SolverFailure, format!("Poisson system factorization failed: {:?}", e))
    })?;
    let solution = cholesky.solve(&rhs);
    for (row, &(x, y)) in interior.iter().enumerate() {
        let c = |k: usize| solution[(row, k)] as f32;
        dst.put_pixel(x, y, Rgb([c(0), c(1), c(2)]));
    }
    Ok(())
}

fn to_float_image(image: &RgbImage) -> Rgb32FImage {
    Rgb32FImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        Rgb([p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0])
    })
}

fn level_patch(
    patched: &PatchedMesh,
    seams: &SeamVertices,
    patch_idx: usize,
) -> Result<RgbImage> {
    let source = &patched.patch_images[patch_idx];
    let original = to_float_image(source);
    let mut image = original.clone();
    let (w, h) = source.dimensions();
    let mut mask = GrayImage::new(w, h);
    for &face_idx in &patched.patches[patch_idx].faces {
        rasterize_triangle(patched.uv_coords[face_idx], [w, h], |x, y, _| {
            mask.put_pixel(x, y, Luma([MASK_INTERIOR]))
        });
    }
    let inside = |x: i64, y: i64| x >= 0 && y >= 0 && x < w as i64 && y < h as i64;

    for seam0 in seams.values() {
        if seam0.patches.len() < 2 {
            continue;
        }
        let patch0 = match seam0.patch(patch_idx) {
            Some(patch0) => patch0,
            None => continue,
        };
        let p0 = patch0.proj;
        for edge0 in &patch0.edges {
            let seam1 = match seams.get_index(edge0.other) {
                Some((_, seam1)) => seam1,
                None => continue,
            };
            let p0_adj = match seam1.patch(patch_idx) {
                Some(p) => p.proj,
                None => continue,
            };
            // The other patch sharing this edge.
            let shared = seam0.patches.iter().find(|p| {
                p.patch != patch_idx && p.edges.iter().any(|e| e.other == edge0.other)
            });
            let (patch1, p1_adj) = match shared.and_then(|p| Some((p, seam1.patch(p.patch)?.proj))) {
                Some(found) => found,
                None => continue,
            };
            let image1 = &patched.patch_images[patch1.patch];
            let (dir0, dir1) = (p0_adj - p0, p1_adj - patch1.proj);
            let length = dir0.norm();
            if length <= 0.0 {
                continue;
            }
            draw_line(p0, p0_adj, |x, y| {
                if !inside(x, y) {
                    return;
                }
                let l = (Vector2::new(x as f64, y as f64) - p0).norm() / length;
                let color0 = sample_pixel_f32(p0 + dir0 * l, &original);
                let color1 = sample_pixel(patch1.proj + dir1 * l, image1) / 255.0;
                let c = (color0 + color1) * 0.5;
                image.put_pixel(x as u32, y as u32, Rgb([c[0] as f32, c[1] as f32, c[2] as f32]));
                mask.put_pixel(x as u32, y as u32, Luma([MASK_BORDER]));
            });
        }

        let mean = seam0
            .patches
            .iter()
            .map(|p| sample_pixel(p.proj, &patched.patch_images[p.patch]) / 255.0)
            .sum::<Vector3>()
            / seam0.patches.len() as f64;
        let (x, y) = (p0[0].round() as i64, p0[1].round() as i64);
        if inside(x, y) {
            image.put_pixel(x as u32, y as u32, Rgb([mean[0] as f32, mean[1] as f32, mean[2] as f32]));
            mask.put_pixel(x as u32, y as u32, Luma([MASK_BORDER]));
        }
    }

    process_mask(&mut mask, STRIP_WIDTH);
    poisson_blend(&original, &mut image, &mask)?;

    let mut leveled = source.clone();
    for (x, y, m) in mask.enumerate_pixels() {
        if m[0] != MASK_EMPTY {
            let c = pixel(&image, x, y) * 255.0;
            set_pixel_as_vector3(x, y, c, &mut leveled);
        }
    }
    Ok(leveled)
}

/// High-frequency leveling: blends every patch towards the mean of the
/// patches it meets, in a strip along its seams.
pub fn level_seams_locally(
    patched: &mut PatchedMesh,
    seams: &SeamVertices,
) -> Result<()> {
    info!("  leveling seams locally...");
    let reserved = patched.reserved_patch();
    let leveled = (0..reserved)
        .into_par_iter()
        .map(|patch_idx| level_patch(patched, seams, patch_idx))
        .collect::<Result<Vec<RgbImage>>>()?;
    for (image, leveled) in patched.patch_images.iter_mut().zip(leveled) {
        *image = leveled;
    }
    Ok(())
}
