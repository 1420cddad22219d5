use image::imageops::blur;
use image::{Rgb, RgbImage};
use log::info;
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::texture::*;

const SHARPEN_SIGMA: f32 = 1.5;

pub struct BakedAtlases {
    pub atlases: Vec<RgbImage>,
    pub uv_coords: Vec<[Vector2; 3]>, // In pixels of the face's atlas.
    pub face_atlases: Vec<usize>,
}

fn copy_patch(src: &RgbImage, dst: &mut RgbImage, placement: &Placement) {
    let [x0, y0] = placement.rect.pos;
    for (x, y, p) in src.enumerate_pixels() {
        let (dx, dy) = if placement.flipped { (y, x) } else { (x, y) };
        dst.put_pixel(x0 + dx, y0 + dy, *p);
    }
}

fn to_atlas_coords(uv: Vector2, placement: &Placement) -> Vector2 {
    let pos = Vector2::new(placement.rect.pos[0] as f64, placement.rect.pos[1] as f64);
    if placement.flipped {
        pos + Vector2::new(uv[1], uv[0])
    } else {
        pos + uv
    }
}

/// Unsharp mask: `(1 + w) * image - w * blurred`.
pub fn sharpen(image: &mut RgbImage, weight: f32) {
    if weight <= 0.0 {
        return;
    }
    let blurred = blur(image, SHARPEN_SIGMA);
    for (p, b) in image.pixels_mut().zip(blurred.pixels()) {
        for c in 0..3 {
            let v = (1.0 + weight) * p[c] as f32 - weight * b[c] as f32;
            p[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Copies the patch pixels into their atlases and moves the texture
/// coordinates from patch to atlas space.
pub fn bake_atlases(
    patched: &PatchedMesh,
    layouts: &[AtlasLayout],
    empty_color: Rgb<u8>,
    sharpness_weight: f32,
) -> Result<BakedAtlases> {
    info!("  baking {} texture atlas(es)...", layouts.len());
    let mut patch_places: Vec<Option<(usize, &Placement)>> = vec![None; patched.patches.len()];
    for (atlas_idx, layout) in layouts.iter().enumerate() {
        for placement in &layout.placements {
            patch_places[placement.patch] = Some((atlas_idx, placement));
        }
    }

    let num_faces = patched.face_patches.len();
    let mut uv_coords = Vec::with_capacity(num_faces);
    let mut face_atlases = Vec::with_capacity(num_faces);
    for (face_idx, &patch_idx) in patched.face_patches.iter().enumerate() {
        let (atlas_idx, placement) = patch_places[patch_idx].ok_or_else(|| {
            let desc = format!("patch {} was not packed", patch_idx);
            Error::new(InconsistentState, desc)
        })?;
        uv_coords.push(patched.uv_coords[face_idx].map(|uv| to_atlas_coords(uv, placement)));
        face_atlases.push(atlas_idx);
    }

    let atlases = layouts
        .par_iter()
        .map(|layout| {
            let mut atlas = RgbImage::from_pixel(layout.size, layout.size, empty_color);
            for placement in &layout.placements {
                copy_patch(&patched.patch_images[placement.patch], &mut atlas, placement);
            }
            sharpen(&mut atlas, sharpness_weight);
            atlas
        })
        .collect();

    Ok(BakedAtlases {
        atlases,
        uv_coords,
        face_atlases,
    })
}
