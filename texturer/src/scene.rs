use std::path::{Path, PathBuf};

use image::imageops::{resize, FilterType};
use image::{GrayImage, RgbImage};
use log::debug;
use serde::Deserialize;

use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::fs;

use crate::camera::{Camera, Matrix3};
use crate::mesh::Point3;

pub enum ImageSource {
    File(PathBuf),
    Memory(RgbImage),
}

pub enum MaskSource {
    File(PathBuf),
    Memory(GrayImage),
}

/// Calibrated image. The camera refers to an image of `width x height`
/// pixels; the pixel data is decoded on demand.
pub struct View {
    pub camera: Camera,
    pub width: u32,
    pub height: u32,
    pub image: ImageSource,
    pub mask: Option<MaskSource>,
    pub valid: bool,
}

impl View {
    pub fn new(camera: Camera, image: RgbImage) -> View {
        View {
            camera,
            width: image.width(),
            height: image.height(),
            image: ImageSource::Memory(image),
            mask: None,
            valid: true,
        }
    }

    /// Largest image dimension to load at the given resolution level.
    pub fn resolution(&self, level: u32, min_res: u32, max_res: u32) -> u32 {
        let full = self.width.max(self.height);
        let mut res = full.checked_shr(level).unwrap_or(0);
        res = res.max(min_res.min(full));
        if max_res > 0 {
            res = res.min(max_res);
        }
        res.max(1)
    }

    /// Decodes the image so that its largest dimension equals `size` and
    /// returns it with the camera adjusted to that resolution.
    pub fn load(&self, size: u32) -> Result<(RgbImage, Camera)> {
        let image = match &self.image {
            ImageSource::File(path) => image::open(path)
                .res(|| format!("failed to load image '{}'", path.display()))?
                .into_rgb8(),
            ImageSource::Memory(image) => image.clone(),
        };
        if image.width() != self.width || image.height() != self.height {
            let desc = format!(
                "image is {}x{} while its calibration expects {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            );
            return Err(Error::new(ImageUnavailable, desc));
        }

        let full = self.width.max(self.height);
        if size >= full {
            return Ok((image, self.camera.clone()));
        }

        let scale = size as f64 / full as f64;
        let width = ((self.width as f64 * scale).round() as u32).max(1);
        let height = ((self.height as f64 * scale).round() as u32).max(1);
        debug!(
            "    resizing image from {}x{} to {}x{}",
            self.width, self.height, width, height
        );
        let image = resize(&image, width, height, FilterType::Triangle);
        let camera = self.camera.scaled(
            width as f64 / self.width as f64,
            height as f64 / self.height as f64,
        );
        Ok((image, camera))
    }

    pub fn load_mask(&self, width: u32, height: u32) -> Result<Option<GrayImage>> {
        let mask = match &self.mask {
            None => return Ok(None),
            Some(MaskSource::File(path)) => image::open(path)
                .res(|| format!("failed to load mask '{}'", path.display()))?
                .into_luma8(),
            Some(MaskSource::Memory(mask)) => mask.clone(),
        };
        if mask.dimensions() == (width, height) {
            Ok(Some(mask))
        } else {
            Ok(Some(resize(&mask, width, height, FilterType::Nearest)))
        }
    }
}

#[derive(Deserialize)]
struct ViewRecord {
    image: PathBuf,
    mask: Option<PathBuf>,
    width: u32,
    height: u32,
    k: [[f64; 3]; 3],
    r: [[f64; 3]; 3],
    c: [f64; 3],
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

#[derive(Deserialize)]
struct SceneRecord {
    views: Vec<ViewRecord>,
}

fn to_matrix3(rows: &[[f64; 3]; 3]) -> Matrix3 {
    Matrix3::from_fn(|i, j| rows[i][j])
}

pub fn parse_views(json: &[u8], base_dir: &Path) -> Result<Vec<View>> {
    let scene: SceneRecord =
        serde_json::from_slice(json).res(|| "malformed scene".to_string())?;
    let views = scene
        .views
        .into_iter()
        .map(|v| View {
            camera: Camera {
                k: to_matrix3(&v.k),
                r: to_matrix3(&v.r),
                c: Point3::from(v.c),
            },
            width: v.width,
            height: v.height,
            image: ImageSource::File(base_dir.join(&v.image)),
            mask: v.mask.map(|m| MaskSource::File(base_dir.join(m))),
            valid: v.valid && v.width > 0 && v.height > 0,
        })
        .collect();
    Ok(views)
}

pub fn load_views<P: AsRef<Path>>(path: P) -> Result<Vec<View>> {
    let path = path.as_ref();
    let json = fs::read_file(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_views(&json, base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::test::top_down_camera;
    use base::util::test::*;

    #[test]
    fn test_parse_views() {
        let json = r#"{"views": [
            {"image": "a.jpg", "width": 640, "height": 480,
             "k": [[500, 0, 320], [0, 500, 240], [0, 0, 1]],
             "r": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
             "c": [0, 0, -1]},
            {"image": "b.jpg", "mask": "b.png", "width": 640, "height": 480,
             "k": [[500, 0, 320], [0, 500, 240], [0, 0, 1]],
             "r": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
             "c": [0, 0, -1], "valid": false}
        ]}"#;
        let views = parse_views(json.as_bytes(), Path::new("scene")).unwrap();
        assert_eq!(views.len(), 2);
        assert!(views[0].valid && !views[1].valid);
        assert_eq!(views[0].camera.k[(0, 2)], 320.0);
        assert_eq!(views[0].camera.c, Point3::new(0.0, 0.0, -1.0));
        match &views[1].mask {
            Some(MaskSource::File(p)) => assert_eq!(p, &Path::new("scene/b.png")),
            _ => panic!("mask expected"),
        }
        assert!(parse_views(b"{\"views\": [{}]}", Path::new(".")).is_err());
    }

    #[test]
    fn test_resolution() {
        let camera = top_down_camera(Point3::new(0.0, 0.0, 1.0), 100.0, 100);
        let mut view = View::new(camera, flat_image(2000, 1000, [0, 0, 0]));
        assert_eq!(view.resolution(0, 640, 0), 2000);
        assert_eq!(view.resolution(1, 640, 0), 1000);
        assert_eq!(view.resolution(3, 640, 0), 640);
        assert_eq!(view.resolution(0, 640, 1500), 1500);
        view.width = 300;
        view.height = 200;
        assert_eq!(view.resolution(2, 640, 0), 300);
    }

    #[test]
    fn test_load_downscaled() {
        let camera = top_down_camera(Point3::new(0.0, 0.0, 1.0), 100.0, 100);
        let view = View::new(camera.clone(), flat_image(100, 50, [9, 9, 9]));
        let (image, scaled) = view.load(50).unwrap();
        assert_eq!(image.dimensions(), (50, 25));
        assert_eq!(scaled, camera.scaled(0.5, 0.5));
        let (image, same) = view.load(640).unwrap();
        assert_eq!(image.dimensions(), (100, 50));
        assert_eq!(same, camera);
    }
}
