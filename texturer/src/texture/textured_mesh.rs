use image::{Rgb, RgbImage};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use structopt::StructOpt;

use base::defs::{Error, ErrorKind::*, Result};
use base::util::cli::RgbColor;

use crate::mesh::smooth_face_normals;
use crate::scene::View;
use crate::texture::*;

const NORMAL_SMOOTHING_ANGLE: f64 = 25.0;
const NORMAL_SMOOTHING_WEIGHT: f64 = 0.5;
const NORMAL_SMOOTHING_ITERS: usize = 3;

#[derive(Clone, Debug, StructOpt)]
pub struct TextureParams {
    #[structopt(
        help = "Image scale-down exponent (0 uses full resolution)",
        long,
        default_value = "0"
    )]
    pub resolution_level: u32,
    #[structopt(
        help = "Lower bound for the largest loaded image dimension",
        long,
        default_value = "640"
    )]
    pub min_resolution: u32,
    #[structopt(
        help = "Upper bound for the largest loaded image dimension (0 for none)",
        long,
        default_value = "0"
    )]
    pub max_resolution: u32,
    #[structopt(
        help = "Views shared by faces grouped into virtual faces (0 disables)",
        long,
        default_value = "0"
    )]
    pub min_common_cameras: usize,
    #[structopt(
        help = "Maximum normal deviation within a virtual face in degrees",
        long,
        default_value = "25"
    )]
    pub virtual_face_max_angle: f64,
    // Gauss methods keep every view of a face when the color covariance is
    // singular, as with gray samples; only median rejects outliers there.
    #[structopt(
        help = "Outlier view detection: 'median', 'gauss' or 'gauss-damping'",
        long,
        default_value = "gauss"
    )]
    pub outlier_method: OutlierMethod,
    #[structopt(
        help = "Outlier threshold (method specific default, 0 disables)",
        long
    )]
    pub outlier_threshold: Option<f64>,
    #[structopt(
        help = "Weight of the data term against the smoothness term",
        long,
        default_value = "0.1"
    )]
    pub smoothness_ratio: f64,
    #[structopt(help = "Skip global seam leveling", long)]
    pub skip_global_seam_leveling: bool,
    #[structopt(help = "Skip local seam leveling", long)]
    pub skip_local_seam_leveling: bool,
    #[structopt(
        help = "Texture size multiple (0 for powers of two)",
        long,
        default_value = "0"
    )]
    pub texture_size_multiple: u32,
    #[structopt(
        help = "Packing heuristic as strategy * 100 + split * 10 + rule",
        long,
        default_value = "3"
    )]
    pub packing_heuristic: u32,
    #[structopt(
        help = "Color of texture areas without data ('r,g,b' or '#rrggbb')",
        long,
        default_value = "255,127,39"
    )]
    pub empty_color: RgbColor,
    #[structopt(
        help = "Sharpening weight of the atlases (0 disables)",
        long,
        default_value = "0.5"
    )]
    pub sharpness_weight: f32,
    #[structopt(
        help = "Mask label to ignore (-1 detects invalid borders, -2 disables)",
        long,
        default_value = "-1",
        allow_hyphen_values = true
    )]
    pub ignore_mask_label: i32,
    #[structopt(
        help = "Maximum texture size (0 for unbounded)",
        long,
        default_value = "8192"
    )]
    pub max_texture_size: u32,
    #[structopt(
        help = "Indices of the views to use (all valid views if omitted)",
        long,
        use_delimiter = true
    )]
    pub views: Vec<usize>,
    #[structopt(help = "Random seed for reproducible results", long)]
    pub seed: Option<u64>,
}

impl Default for TextureParams {
    fn default() -> Self {
        TextureParams {
            resolution_level: 0,
            min_resolution: 640,
            max_resolution: 0,
            min_common_cameras: 0,
            virtual_face_max_angle: 25.0,
            outlier_method: OutlierMethod::Gauss,
            outlier_threshold: None,
            smoothness_ratio: 0.1,
            skip_global_seam_leveling: false,
            skip_local_seam_leveling: false,
            texture_size_multiple: 0,
            packing_heuristic: 3,
            empty_color: RgbColor([255, 127, 39]),
            sharpness_weight: 0.5,
            ignore_mask_label: -1,
            max_texture_size: 8192,
            views: vec![],
            seed: None,
        }
    }
}

impl TextureParams {
    pub fn outlier_threshold(&self) -> f64 {
        self.outlier_threshold.unwrap_or(match self.outlier_method {
            OutlierMethod::Median => MEDIAN_DEFAULT_THRESHOLD,
            OutlierMethod::Gauss | OutlierMethod::GaussDamping => GAUSS_DEFAULT_THRESHOLD,
        })
    }

    fn empty_color(&self) -> Rgb<u8> {
        Rgb(self.empty_color.0)
    }

    /// Valid candidate views, in increasing order.
    fn candidate_views(&self, views: &[View]) -> Result<Vec<usize>> {
        if let Some(&bad) = self.views.iter().find(|&&v| v >= views.len()) {
            let desc = format!("view {} requested but only {} exist", bad, views.len());
            return Err(Error::new(BadParameter, desc));
        }
        let mut idxs: Vec<usize> = if self.views.is_empty() {
            (0..views.len()).collect()
        } else {
            self.views.clone()
        };
        idxs.sort_unstable();
        idxs.dedup();
        idxs.retain(|&v| views[v].valid);
        Ok(idxs)
    }
}

/// Faces assigned to views, along with what later stages still need.
struct FaceLabeling {
    face_graph: FaceGraph,
    labels: Vec<Option<usize>>,
    images: Vec<Option<ViewImage>>,
}

fn label_faces<R: Rng>(
    mesh: &Mesh,
    views: &[View],
    view_idxs: &[usize],
    params: &TextureParams,
    minimizer: &dyn EnergyMinimizer,
    rng: &mut R,
) -> Result<FaceLabeling> {
    let topo = MeshTopology::new(mesh);
    let face_normals = smooth_face_normals(
        &mesh.face_normals(),
        &topo,
        NORMAL_SMOOTHING_ANGLE,
        NORMAL_SMOOTHING_WEIGHT,
        NORMAL_SMOOTHING_ITERS,
    );

    let FaceViews {
        mut faces_datas,
        images,
    } = list_camera_faces(mesh, &face_normals, views, view_idxs, params)?;
    let threshold = params.outlier_threshold();
    if threshold > 0.0 {
        filter_outliers(&mut faces_datas, params.outlier_method, threshold);
    }

    info!("  selecting views for mesh faces...");
    let camera_centers: Vec<Point3> = views.iter().map(|v| v.camera.c).collect();
    let face_graph = FaceGraph::new(&topo, &faces_datas);
    let labels = select_views(
        mesh,
        &topo,
        &face_normals,
        &face_graph,
        &faces_datas,
        &camera_centers,
        params,
        minimizer,
        rng,
    )?;
    Ok(FaceLabeling {
        face_graph,
        labels,
        images,
    })
}

/// Mesh with per-face texture coordinates in pixels of the atlas the face
/// is assigned to.
pub struct TexturedMesh {
    pub mesh: Mesh,
    pub uv_coords: Vec<[Vector2; 3]>,
    pub face_atlases: Vec<usize>,
    pub atlases: Vec<RgbImage>,
}

impl TexturedMesh {
    pub fn new(views: &[View], mesh: Mesh, params: &TextureParams) -> Result<TexturedMesh> {
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_solvers(
            views,
            mesh,
            params,
            &LoopyBeliefPropagation::default(),
            &UnionFindComponents,
            &mut rng,
        )
    }

    pub fn with_solvers<R: Rng>(
        views: &[View],
        mesh: Mesh,
        params: &TextureParams,
        minimizer: &dyn EnergyMinimizer,
        components: &dyn ConnectedComponents,
        rng: &mut R,
    ) -> Result<TexturedMesh> {
        mesh.validate()?;
        if mesh.faces.is_empty() {
            return Err(Error::new(MalformedData, "mesh has no faces".to_string()));
        }
        let view_idxs = params.candidate_views(views)?;
        info!(
            "texturing {} faces with {} of {} views...",
            mesh.faces.len(),
            view_idxs.len(),
            views.len()
        );

        let FaceLabeling {
            face_graph,
            labels,
            images,
        } = label_faces(&mesh, views, &view_idxs, params, minimizer, rng)?;

        info!("  generating texture patches...");
        let segmentation = segment_patches(face_graph, &labels, components);
        let mut patched = project_patches(&mesh, segmentation, &images, params.empty_color())?;
        drop(images);
        info!("  {} texture patches", patched.patches.len());

        if patched.patches.len() > 2 {
            let seams = create_seam_vertices(&mesh, &patched);
            if !params.skip_global_seam_leveling {
                level_seams_globally(&mesh, &mut patched, &seams)?;
            }
            if !params.skip_local_seam_leveling {
                level_seams_locally(&mut patched, &seams)?;
            }
        }
        merge_nested_patches(&mut patched);

        info!("  packing texture patches...");
        let heuristic = PackingHeuristic::from_id(params.packing_heuristic)?;
        let sizes: Vec<[u32; 2]> = patched.patches.iter().map(|p| p.rect.size).collect();
        let layouts = pack_atlases(
            &sizes,
            heuristic,
            params.texture_size_multiple,
            params.max_texture_size,
        )?;
        let BakedAtlases {
            atlases,
            uv_coords,
            face_atlases,
        } = bake_atlases(&patched, &layouts, params.empty_color(), params.sharpness_weight)?;

        Ok(TexturedMesh {
            mesh,
            uv_coords,
            face_atlases,
            atlases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::test::top_down_camera;
    use crate::mesh::test::grid_mesh;
    use crate::texture::test::two_view_quad_scene;
    use base::util::test::checkerboard;

    fn params() -> TextureParams {
        TextureParams {
            seed: Some(7),
            sharpness_weight: 0.0,
            ..Default::default()
        }
    }

    /// Grid seen by two cameras shifted towards opposite sides, so that
    /// each half of it is better seen by a different view.
    fn two_sided_grid_scene() -> (Mesh, Vec<View>) {
        let views = [0.1, 0.9]
            .iter()
            .map(|&x| {
                View::new(
                    top_down_camera(Point3::new(x, 0.5, 2.0), 200.0, 201),
                    checkerboard(201, 201, 4, 20, 230),
                )
            })
            .collect();
        (grid_mesh(10), views)
    }

    fn check_uvs(textured: &TexturedMesh) {
        for (uvs, &atlas) in textured.uv_coords.iter().zip(&textured.face_atlases) {
            let size = textured.atlases[atlas].width() as f64;
            for uv in uvs {
                assert!(uv.iter().all(|&c| (0.0..size).contains(&c)), "{:?}", uv);
            }
        }
    }

    #[test]
    fn test_two_views_one_patch() {
        let (mesh, views) = two_view_quad_scene();
        let textured = TexturedMesh::new(&views, mesh, &params()).unwrap();
        assert_eq!(textured.atlases.len(), 1);
        assert_eq!(textured.face_atlases, vec![0, 0]);
        assert_eq!(textured.atlases[0].width(), 64);
        check_uvs(&textured);
        // Both faces share the projection of the quad diagonal.
        assert_eq!(textured.uv_coords[0][0], textured.uv_coords[1][0]);
        assert_eq!(textured.uv_coords[0][2], textured.uv_coords[1][1]);
    }

    #[test]
    fn test_two_views_pick_the_sharper_one() {
        let (mesh, views) = two_view_quad_scene();
        let p = params();
        let mut rng = StdRng::seed_from_u64(7);
        let labeling = label_faces(
            &mesh,
            &views,
            &[0, 1],
            &p,
            &LoopyBeliefPropagation::default(),
            &mut rng,
        )
        .unwrap();
        assert_eq!(labeling.labels, vec![Some(0), Some(0)]);

        let seg = segment_patches(labeling.face_graph, &labeling.labels, &UnionFindComponents);
        assert_eq!(seg.patches.len(), 2);
        assert_eq!(seg.face_patches, vec![0, 0]);
        assert_eq!(seg.patches[0].label, Some(0));
        assert!(seg.patches[seg.reserved_patch()].faces.is_empty());
    }

    #[test]
    fn test_two_sided_grid_uses_both_views() {
        let (mesh, views) = two_sided_grid_scene();
        let mut rng = StdRng::seed_from_u64(7);
        let labeling = label_faces(
            &mesh,
            &views,
            &[0, 1],
            &params(),
            &LoopyBeliefPropagation::default(),
            &mut rng,
        )
        .unwrap();
        assert!(labeling.labels.contains(&Some(0)));
        assert!(labeling.labels.contains(&Some(1)));
    }

    #[test]
    fn test_two_sided_grid_with_seam_leveling() {
        let (mesh, views) = two_sided_grid_scene();
        let p = TextureParams {
            max_texture_size: 0,
            ..params()
        };
        let textured = TexturedMesh::new(&views, mesh, &p).unwrap();
        assert!(!textured.atlases.is_empty());
        assert_eq!(textured.face_atlases.len(), 200);
        assert!(textured.face_atlases.iter().all(|&a| a < textured.atlases.len()));
        check_uvs(&textured);

        let (mesh, views) = two_sided_grid_scene();
        let p = TextureParams {
            max_texture_size: 96,
            ..params()
        };
        let err = TexturedMesh::new(&views, mesh, &p).err().unwrap();
        assert_eq!(err.kind, BadParameter);
    }

    #[test]
    fn test_size_limit_splits_atlases() {
        let (mut mesh, views) = two_view_quad_scene();
        let n = mesh.vertices.len();
        mesh.vertices.push(Point3::new(5.0, 5.0, 0.0));
        mesh.vertices.push(Point3::new(6.0, 5.0, 0.0));
        mesh.vertices.push(Point3::new(5.0, 6.0, 0.0));
        mesh.faces.push([n, n + 1, n + 2]);
        let p = TextureParams {
            max_texture_size: 56,
            ..params()
        };
        // The 55px patch leaves no room for the swatch.
        let textured = TexturedMesh::new(&views, mesh, &p).unwrap();
        assert_eq!(textured.atlases.len(), 2);
        assert_eq!(textured.face_atlases[0], textured.face_atlases[1]);
        assert_ne!(textured.face_atlases[0], textured.face_atlases[2]);
        assert!(textured.atlases.iter().all(|a| a.width() <= 56));
        check_uvs(&textured);
    }

    #[test]
    fn test_unseen_face_uses_swatch() {
        let (mut mesh, views) = two_view_quad_scene();
        let n = mesh.vertices.len();
        mesh.vertices.push(Point3::new(5.0, 5.0, 0.0));
        mesh.vertices.push(Point3::new(6.0, 5.0, 0.0));
        mesh.vertices.push(Point3::new(5.0, 6.0, 0.0));
        mesh.faces.push([n, n + 1, n + 2]);
        let textured = TexturedMesh::new(&views, mesh, &params()).unwrap();
        check_uvs(&textured);
        let uv = textured.uv_coords[2];
        assert_eq!(uv[0], uv[1]);
        assert_eq!(uv[0], uv[2]);
        let atlas = &textured.atlases[textured.face_atlases[2]];
        let pixel = atlas.get_pixel(uv[0][0] as u32, uv[0][1] as u32);
        assert_eq!(pixel, &Rgb([255, 127, 39]));
    }

    #[test]
    fn test_view_subset() {
        let (mesh, mut views) = two_view_quad_scene();
        let mut p = params();
        p.views = vec![1, 1];
        assert_eq!(p.candidate_views(&views).unwrap(), vec![1]);
        views[1].valid = false;
        assert!(p.candidate_views(&views).unwrap().is_empty());
        p.views = vec![2];
        let err = TexturedMesh::new(&views, mesh, &p).err().unwrap();
        assert_eq!(err.kind, BadParameter);
    }

    #[test]
    fn test_outlier_threshold_defaults() {
        let mut p = TextureParams::default();
        assert_eq!(p.outlier_threshold(), GAUSS_DEFAULT_THRESHOLD);
        p.outlier_method = OutlierMethod::Median;
        assert_eq!(p.outlier_threshold(), MEDIAN_DEFAULT_THRESHOLD);
        p.outlier_threshold = Some(0.0);
        assert_eq!(p.outlier_threshold(), 0.0);
    }

    #[test]
    fn test_params_from_args() {
        let p = TextureParams::from_iter_safe(&[
            "texturer",
            "--ignore-mask-label",
            "-2",
            "--views",
            "0,2",
            "--empty-color",
            "#000000",
            "--outlier-method",
            "median",
        ])
        .unwrap();
        assert_eq!(p.ignore_mask_label, -2);
        assert_eq!(p.views, vec![0, 2]);
        assert_eq!(p.empty_color, RgbColor([0, 0, 0]));
        assert_eq!(p.outlier_method, OutlierMethod::Median);
        assert_eq!(p.max_texture_size, 8192);
    }
}
