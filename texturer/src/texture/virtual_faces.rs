use std::collections::{HashSet, VecDeque};

use log::info;
use rand::Rng;

use crate::texture::*;

const ANGLE_TO_QUALITY_RATIO: f64 = 0.67;

/// Groups of adjacent, nearly coplanar faces that are all seen by a common
/// set of views. Every face belongs to exactly one virtual face.
pub struct VirtualFaces {
    pub faces: Vec<Vec<usize>>,
    pub datas: Vec<FaceDataArr>,
    pub face_to_virtual: Vec<usize>,
}

fn cos_angle(a: &Vector3, b: &Vector3) -> f64 {
    let n = a.norm() * b.norm();
    if n > 0.0 {
        a.dot(b) / n
    } else {
        0.0
    }
}

/// Views ranked by a blend of viewing angle and quality, best first; at most
/// `count` of them.
pub fn select_best_views(
    datas: &FaceDataArr,
    face_center: &Point3,
    face_normal: &Vector3,
    camera_centers: &[Point3],
    count: usize,
) -> Vec<usize> {
    let max_quality = datas.iter().map(|d| d.quality).fold(0.0, f64::max);
    let mut scored: Vec<(f64, usize)> = datas
        .iter()
        .map(|d| {
            let cos = cos_angle(&(camera_centers[d.view] - face_center), face_normal);
            let quality = if max_quality > 0.0 {
                d.quality / max_quality
            } else {
                0.0
            };
            let score = ANGLE_TO_QUALITY_RATIO * cos
                + (1.0 - ANGLE_TO_QUALITY_RATIO) * quality;
            (score, d.view)
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(count).map(|(_, view)| view).collect()
}

fn seen_by_all(datas: &FaceDataArr, views: &[usize]) -> bool {
    views.iter().all(|v| datas.iter().any(|d| d.view == *v))
}

impl VirtualFaces {
    pub fn new<R: Rng>(
        mesh: &Mesh,
        topo: &MeshTopology,
        face_normals: &[Vector3],
        faces_datas: &[FaceDataArr],
        camera_centers: &[Point3],
        min_common_cameras: usize,
        max_normal_deviation: f64,
        rng: &mut R,
    ) -> VirtualFaces {
        let num_faces = mesh.faces.len();
        let min_cos = max_normal_deviation.to_radians().cos();

        // Unclaimed faces with O(1) removal.
        let mut remaining: Vec<usize> = (0..num_faces).collect();
        let mut remaining_pos: Vec<usize> = (0..num_faces).collect();
        let mut claim = |face_idx: usize, remaining: &mut Vec<usize>| {
            let pos = remaining_pos[face_idx];
            let last = remaining.len() - 1;
            remaining.swap(pos, last);
            remaining_pos[remaining[pos]] = pos;
            remaining.pop();
        };

        let mut selected = vec![false; num_faces];
        let mut faces = Vec::new();
        let mut datas = Vec::new();
        while !remaining.is_empty() {
            let seed = remaining[rng.gen_range(0..remaining.len())];
            let seed_datas = &faces_datas[seed];
            if seed_datas.is_empty() {
                claim(seed, &mut remaining);
                selected[seed] = true;
                faces.push(vec![seed]);
                datas.push(FaceDataArr::new());
                continue;
            }

            let views = select_best_views(
                seed_datas,
                &mesh.face_center(seed),
                &face_normals[seed],
                camera_centers,
                min_common_cameras,
            );
            let seed_normal = face_normals[seed];
            let mut members = Vec::new();
            let mut queue = VecDeque::from([seed]);
            let mut queued = HashSet::from([seed]);
            while let Some(face_idx) = queue.pop_front() {
                if face_idx != seed
                    && (cos_angle(&seed_normal, &face_normals[face_idx]) < min_cos
                        || !seen_by_all(&faces_datas[face_idx], &views))
                {
                    continue;
                }
                claim(face_idx, &mut remaining);
                selected[face_idx] = true;
                members.push(face_idx);
                for adj in topo.neighbouring_faces(face_idx) {
                    if !selected[adj] && queued.insert(adj) {
                        queue.push_back(adj);
                    }
                }
            }

            // Average quality and color of the common views.
            let merged = views
                .iter()
                .map(|&view| {
                    let seen: Vec<&FaceData> = members
                        .iter()
                        .filter_map(|&f| faces_datas[f].iter().find(|d| d.view == view))
                        .collect();
                    let n = seen.len().max(1) as f64;
                    FaceData {
                        view,
                        quality: seen.iter().map(|d| d.quality).sum::<f64>() / n,
                        color: seen.iter().map(|d| d.color).sum::<Vector3>() / n,
                    }
                })
                .collect();
            faces.push(members);
            datas.push(merged);
        }

        let mut face_to_virtual = vec![0; num_faces];
        for (virtual_idx, members) in faces.iter().enumerate() {
            for &face_idx in members {
                face_to_virtual[face_idx] = virtual_idx;
            }
        }

        info!(
            "  grouped {} faces into {} virtual faces",
            num_faces,
            faces.len()
        );
        VirtualFaces {
            faces,
            datas,
            face_to_virtual,
        }
    }

    /// Pairs of adjacent virtual faces, each listed once in increasing order.
    pub fn adjacency(&self, topo: &MeshTopology) -> Vec<[usize; 2]> {
        let mut edges = HashSet::new();
        for (virtual_idx, members) in self.faces.iter().enumerate() {
            for &face_idx in members {
                for adj in topo.neighbouring_faces(face_idx) {
                    let other = self.face_to_virtual[adj];
                    if other > virtual_idx {
                        edges.insert([virtual_idx, other]);
                    }
                }
            }
        }
        let mut edges: Vec<[usize; 2]> = edges.into_iter().collect();
        edges.sort_unstable();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::test::grid_mesh;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn data(view: usize, quality: f64) -> FaceData {
        FaceData {
            view,
            quality,
            color: Vector3::new(100.0, 128.0, 128.0),
        }
    }

    fn centers() -> Vec<Point3> {
        vec![
            Point3::new(0.5, 0.5, 2.0),
            Point3::new(3.0, 0.5, 0.5),
            Point3::new(0.5, 0.6, 2.0),
        ]
    }

    #[test]
    fn test_select_best_views() {
        let datas = vec![data(0, 1.0), data(1, 1.0), data(2, 0.2)];
        let center = Point3::new(0.5, 0.5, 0.0);
        let normal = Vector3::new(0.0, 0.0, 1.0);
        let views = select_best_views(&datas, &center, &normal, &centers(), 2);
        assert_eq!(views, vec![0, 2]);
        let views = select_best_views(&datas, &center, &normal, &centers(), 5);
        assert_eq!(views.len(), 3);
    }

    #[test]
    fn test_planar_grid_becomes_one_virtual_face() {
        let mesh = grid_mesh(3);
        let topo = MeshTopology::new(&mesh);
        let normals = mesh.face_normals();
        let mut faces_datas: Vec<FaceDataArr> = (0..mesh.faces.len())
            .map(|f| vec![data(0, 1.0 + f as f64), data(2, 0.5)])
            .collect();
        // An unseen face forms its own virtual face.
        faces_datas[17].clear();

        let mut rng = StdRng::seed_from_u64(0);
        let vf = VirtualFaces::new(
            &mesh, &topo, &normals, &faces_datas, &centers(), 2, 25.0, &mut rng,
        );
        assert_eq!(vf.faces.len(), 2);
        let big = vf.face_to_virtual[0];
        let single = vf.face_to_virtual[17];
        assert_eq!(vf.faces[single], vec![17]);
        assert!(vf.datas[single].is_empty());
        assert_eq!(vf.faces[big].len(), 17);
        assert_eq!(vf.datas[big].len(), 2);
        let q0 = vf.datas[big].iter().find(|d| d.view == 0).unwrap().quality;
        let expected = (0..17).map(|f| 1.0 + f as f64).sum::<f64>() / 17.0;
        assert!((q0 - expected).abs() < 1e-9);
        assert_eq!(vf.adjacency(&topo), vec![[big.min(single), big.max(single)]]);
    }

    #[test]
    fn test_normal_deviation_splits_faces() {
        let mut mesh = grid_mesh(1);
        // Fold the second triangle up around the diagonal.
        mesh.vertices[2] = Point3::new(0.5, 0.5, 1.0);
        let topo = MeshTopology::new(&mesh);
        let normals = mesh.face_normals();
        assert!(normals[0].dot(&normals[1]) < 0.9);
        let faces_datas = vec![vec![data(0, 1.0)], vec![data(0, 1.0)]];
        let mut rng = StdRng::seed_from_u64(7);
        let vf = VirtualFaces::new(
            &mesh, &topo, &normals, &faces_datas, &centers(), 1, 25.0, &mut rng,
        );
        assert_eq!(vf.faces.len(), 2);
    }
}
