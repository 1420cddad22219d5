use image::imageops::crop_imm;
use image::{GrayImage, Luma, Rgb, RgbImage};
use log::info;
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::texture::*;

const RESERVED_PATCH_SIZE: u32 = 5;

/// Patches together with their cropped source pixels. Texture coordinates
/// are relative to the owning patch rectangle.
pub struct PatchedMesh {
    pub patches: Vec<TexturePatch>,
    pub patch_images: Vec<RgbImage>,
    pub face_patches: Vec<usize>,
    pub uv_coords: Vec<[Vector2; 3]>,
    pub seam_edges: Vec<[usize; 2]>,
}

impl PatchedMesh {
    pub fn reserved_patch(&self) -> usize {
        self.patches.len() - 1
    }
}

struct ProjectedPatch {
    rect: Rectangle<u32>,
    image: RgbImage,
    uvs: Vec<[Vector2; 3]>,
}

fn project_patch(
    mesh: &Mesh,
    patch: &TexturePatch,
    view_image: &ViewImage,
) -> Result<ProjectedPatch> {
    let mut abs_uvs = Vec::with_capacity(patch.faces.len());
    for &face_idx in &patch.faces {
        let mut uv = [Vector2::zeros(); 3];
        for (k, &v) in mesh.faces[face_idx].iter().enumerate() {
            uv[k] = view_image
                .camera
                .project(&mesh.vertices[v])
                .ok_or_else(|| {
                    let desc = format!("face {} projects behind its view", face_idx);
                    Error::new(InconsistentState, desc)
                })?
                .point;
        }
        abs_uvs.push(uv);
    }

    let (w, h) = view_image.image.dimensions();
    let mut lo = Vector2::repeat(f64::INFINITY);
    let mut hi = Vector2::repeat(f64::NEG_INFINITY);
    for p in abs_uvs.iter().flatten() {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }
    let border = PATCH_BORDER as f64;
    let x0 = (lo[0].floor() - border).max(0.0) as u32;
    let y0 = (lo[1].floor() - border).max(0.0) as u32;
    let x1 = ((hi[0].ceil() + border) as u32).min(w - 1);
    let y1 = ((hi[1].ceil() + border) as u32).min(h - 1);
    if x1 < x0 || y1 < y0 {
        return Err(Error::new(
            InconsistentState,
            format!("patch of view {:?} lies outside its image", patch.label),
        ));
    }
    let rect = Rectangle::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1);
    let offset = Vector2::new(x0 as f64, y0 as f64);
    let image = crop_imm(&view_image.image, x0, y0, rect.size[0], rect.size[1]).to_image();
    let uvs = abs_uvs
        .into_iter()
        .map(|uv| uv.map(|p| p - offset))
        .collect();
    Ok(ProjectedPatch { rect, image, uvs })
}

/// Projects every patch into its view, computes the patch rectangles and
/// copies their pixels out of the view images.
pub fn project_patches(
    mesh: &Mesh,
    segmentation: Segmentation,
    images: &[Option<ViewImage>],
    empty_color: Rgb<u8>,
) -> Result<PatchedMesh> {
    let Segmentation {
        mut patches,
        face_patches,
        seam_edges,
    } = segmentation;
    let reserved = patches.len() - 1;

    let projected: Vec<ProjectedPatch> = patches[..reserved]
        .par_iter()
        .map(|patch| {
            let view_image = patch
                .label
                .and_then(|view| images.get(view))
                .and_then(Option::as_ref)
                .ok_or_else(|| {
                    let desc = format!("no image loaded for view {:?}", patch.label);
                    Error::new(InconsistentState, desc)
                })?;
            project_patch(mesh, patch, view_image)
        })
        .collect::<Result<_>>()?;

    let mut uv_coords = vec![[Vector2::zeros(); 3]; mesh.faces.len()];
    let mut patch_images = Vec::with_capacity(patches.len());
    for (patch, projected) in patches.iter_mut().zip(projected) {
        patch.rect = projected.rect;
        for (&face_idx, uv) in patch.faces.iter().zip(projected.uvs) {
            uv_coords[face_idx] = uv;
        }
        patch_images.push(projected.image);
    }

    // Faces without a view all sample the center of a small swatch.
    let center = (RESERVED_PATCH_SIZE / 2) as f64;
    patches[reserved].rect = Rectangle::new(0, 0, RESERVED_PATCH_SIZE, RESERVED_PATCH_SIZE);
    for &face_idx in &patches[reserved].faces {
        uv_coords[face_idx] = [Vector2::new(center, center); 3];
    }
    patch_images.push(RgbImage::from_pixel(
        RESERVED_PATCH_SIZE,
        RESERVED_PATCH_SIZE,
        empty_color,
    ));

    Ok(PatchedMesh {
        patches,
        patch_images,
        face_patches,
        uv_coords,
        seam_edges,
    })
}

/// Pixels covered by the given faces, grown by one pixel.
fn coverage_mask(uvs: &[[Vector2; 3]], size: [u32; 2]) -> GrayImage {
    let mut mask = GrayImage::new(size[0], size[1]);
    for &tri in uvs {
        rasterize_triangle(tri, size, |x, y, _| mask.put_pixel(x, y, Luma([255])));
    }
    let mut grown = mask.clone();
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        for (dx, dy) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if nx >= 0 && ny >= 0 && nx < size[0] as i64 && ny < size[1] as i64 {
                grown.put_pixel(nx as u32, ny as u32, Luma([255]));
            }
        }
    }
    grown
}

/// Folds every patch whose rectangle lies inside the rectangle of another
/// patch of the same view into that patch.
pub fn merge_nested_patches(patched: &mut PatchedMesh) {
    let mut merged = 0;
    let mut i = 0;
    while i < patched.reserved_patch() {
        let host = (0..patched.reserved_patch()).find(|&j| {
            j != i
                && patched.patches[j].label == patched.patches[i].label
                && patched.patches[j].rect.contains(&patched.patches[i].rect)
        });
        let host = match host {
            Some(host) => host,
            None => {
                i += 1;
                continue;
            }
        };

        let inner = patched.patches.remove(i);
        let inner_image = patched.patch_images.remove(i);
        let host = if host > i { host - 1 } else { host };
        let offset = Vector2::new(
            inner.rect.pos[0] as f64 - patched.patches[host].rect.pos[0] as f64,
            inner.rect.pos[1] as f64 - patched.patches[host].rect.pos[1] as f64,
        );
        let inner_uvs: Vec<[Vector2; 3]> =
            inner.faces.iter().map(|&f| patched.uv_coords[f]).collect();
        let mask = coverage_mask(&inner_uvs, inner.rect.size);
        let host_image = &mut patched.patch_images[host];
        for (x, y, p) in mask.enumerate_pixels() {
            if p[0] != 0 {
                let (hx, hy) = (x + offset[0] as u32, y + offset[1] as u32);
                host_image.put_pixel(hx, hy, *inner_image.get_pixel(x, y));
            }
        }
        for &face_idx in &inner.faces {
            patched.uv_coords[face_idx] = patched.uv_coords[face_idx].map(|p| p + offset);
        }
        patched.patches[host].faces.extend(inner.faces);
        for patch_idx in patched.face_patches.iter_mut() {
            if *patch_idx == i {
                *patch_idx = host;
            } else if *patch_idx > i {
                *patch_idx -= 1;
            }
        }
        merged += 1;
    }
    if merged > 0 {
        info!("  merged {} nested texture patches", merged);
    }
}
