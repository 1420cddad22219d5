use std::collections::HashMap;

use base::defs::{Error, ErrorKind::*, Result};

pub type Point3 = nalgebra::Point3<f64>;
pub type Vector3 = nalgebra::Vector3<f64>;

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Point3>,
    pub normals: Vec<Vector3>,
    pub faces: Vec<[usize; 3]>,
}

impl Mesh {
    pub fn validate(&self) -> Result<()> {
        if !self.normals.is_empty() && self.normals.len() != self.vertices.len()
        {
            let desc = format!(
                "mesh has {} normals for {} vertices",
                self.normals.len(),
                self.vertices.len()
            );
            return Err(Error::new(MalformedData, desc));
        }
        for (face_idx, face) in self.faces.iter().enumerate() {
            if face.iter().any(|&v| v >= self.vertices.len()) {
                let desc = format!(
                    "face {} references a missing vertex ({:?})",
                    face_idx, face
                );
                return Err(Error::new(MalformedData, desc));
            }
        }
        Ok(())
    }

    pub fn face_center(&self, face_idx: usize) -> Point3 {
        let [v0, v1, v2] = self.faces[face_idx];
        Point3::from(
            (self.vertices[v0].coords
                + self.vertices[v1].coords
                + self.vertices[v2].coords)
                / 3.0,
        )
    }

    /// Unit normal following the counter-clockwise winding, zero for
    /// degenerate faces.
    pub fn face_normal(&self, face_idx: usize) -> Vector3 {
        let [v0, v1, v2] = self.faces[face_idx];
        let diff1 = self.vertices[v1] - self.vertices[v0];
        let diff2 = self.vertices[v2] - self.vertices[v0];
        diff1
            .cross(&diff2)
            .try_normalize(f64::EPSILON)
            .unwrap_or_else(Vector3::zeros)
    }

    pub fn face_normals(&self) -> Vec<Vector3> {
        (0..self.faces.len()).map(|f| self.face_normal(f)).collect()
    }

    /// Largest distance between a face center and its vertices.
    pub fn max_face_radius(&self) -> f64 {
        (0..self.faces.len())
            .map(|f| {
                let c = self.face_center(f);
                self.faces[f]
                    .iter()
                    .map(|&v| (self.vertices[v] - c).norm())
                    .fold(0.0, f64::max)
            })
            .fold(0.0, f64::max)
    }
}

/// Adjacency caches derived from the face list. Built once, read-only
/// afterwards and dropped as soon as labeling is done.
pub struct MeshTopology {
    pub vertex_faces: Vec<Vec<usize>>,
    // Neighbour across the edge (face[k], face[(k + 1) % 3]).
    pub face_faces: Vec<[Option<usize>; 3]>,
    pub vertex_neighbours: Vec<Vec<usize>>,
    pub vertex_boundary: Vec<bool>,
}

impl MeshTopology {
    pub fn new(mesh: &Mesh) -> MeshTopology {
        let mut vertex_faces = vec![Vec::new(); mesh.vertices.len()];
        let mut edge_faces: HashMap<[usize; 2], Vec<(usize, usize)>> =
            HashMap::new();
        for (face_idx, face) in mesh.faces.iter().enumerate() {
            for k in 0..3 {
                vertex_faces[face[k]].push(face_idx);
                let edge = ordered([face[k], face[(k + 1) % 3]]);
                edge_faces.entry(edge).or_default().push((face_idx, k));
            }
        }

        let mut face_faces = vec![[None; 3]; mesh.faces.len()];
        let mut vertex_neighbours = vec![Vec::new(); mesh.vertices.len()];
        let mut vertex_boundary = vec![false; mesh.vertices.len()];
        for (edge, faces) in edge_faces.iter() {
            vertex_neighbours[edge[0]].push(edge[1]);
            vertex_neighbours[edge[1]].push(edge[0]);
            if let [(f0, k0), (f1, k1)] = faces[..] {
                face_faces[f0][k0] = Some(f1);
                face_faces[f1][k1] = Some(f0);
            } else {
                // Open or non-manifold edge.
                vertex_boundary[edge[0]] = true;
                vertex_boundary[edge[1]] = true;
            }
        }
        for neighbours in vertex_neighbours.iter_mut() {
            neighbours.sort_unstable();
        }

        MeshTopology {
            vertex_faces,
            face_faces,
            vertex_neighbours,
            vertex_boundary,
        }
    }

    pub fn neighbouring_faces(
        &self,
        face_idx: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        self.face_faces[face_idx].iter().flatten().copied()
    }
}

pub fn ordered(e: [usize; 2]) -> [usize; 2] {
    if e[0] <= e[1] {
        e
    } else {
        [e[1], e[0]]
    }
}

/// Local indices of the edge shared by two faces, ordered so that
/// `faces[f0][l0[i]] == faces[f1][l1[i]]`.
pub fn shared_edge(
    mesh: &Mesh,
    f0: usize,
    f1: usize,
) -> Option<([usize; 2], [usize; 2])> {
    let (a, b) = (mesh.faces[f0], mesh.faces[f1]);
    let mut l0 = [0; 2];
    let mut l1 = [0; 2];
    let mut n = 0;
    for i in 0..3 {
        if let Some(j) = b.iter().position(|&v| v == a[i]) {
            if n == 2 {
                return None;
            }
            l0[n] = i;
            l1[n] = j;
            n += 1;
        }
    }
    if n == 2 {
        Some((l0, l1))
    } else {
        None
    }
}

/// Blends each face normal with the normals of its neighbours that deviate
/// less than `max_angle` degrees.
pub fn smooth_face_normals(
    normals: &[Vector3],
    topo: &MeshTopology,
    max_angle: f64,
    original_weight: f64,
    num_iters: usize,
) -> Vec<Vector3> {
    let min_cos = max_angle.to_radians().cos();
    let mut current = normals.to_vec();
    for _ in 0..num_iters {
        current = (0..current.len())
            .map(|f| {
                let n = current[f];
                let (sum, count) = topo
                    .neighbouring_faces(f)
                    .map(|g| current[g])
                    .filter(|m| n.dot(m) >= min_cos)
                    .fold((Vector3::zeros(), 0), |(s, c), m| (s + m, c + 1));
                if count == 0 {
                    return n;
                }
                let blended = n * original_weight
                    + sum * ((1.0 - original_weight) / count as f64);
                blended.try_normalize(f64::EPSILON).unwrap_or(n)
            })
            .collect();
    }
    current
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Unit square in the z = 0 plane made of two counter-clockwise
    /// triangles facing +z.
    pub fn quad_mesh() -> Mesh {
        Mesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            normals: vec![],
            faces: vec![[0, 1, 2], [0, 2, 3]],
        }
    }

    /// Regular grid of `n x n` cells over the unit square, facing +z.
    pub fn grid_mesh(n: usize) -> Mesh {
        let mut mesh = Mesh::default();
        for j in 0..=n {
            for i in 0..=n {
                mesh.vertices.push(Point3::new(
                    i as f64 / n as f64,
                    j as f64 / n as f64,
                    0.0,
                ));
            }
        }
        let idx = |i: usize, j: usize| j * (n + 1) + i;
        for j in 0..n {
            for i in 0..n {
                mesh.faces.push([idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)]);
                mesh.faces.push([idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)]);
            }
        }
        mesh
    }

    #[test]
    fn test_quad_topology() {
        let mesh = quad_mesh();
        let topo = MeshTopology::new(&mesh);
        assert_eq!(topo.vertex_faces[0], vec![0, 1]);
        assert_eq!(topo.vertex_faces[1], vec![0]);
        // Edge (2, 0) of face 0 is shared with edge (0, 2) of face 1.
        assert_eq!(topo.face_faces[0], [None, None, Some(1)]);
        assert_eq!(topo.face_faces[1], [Some(0), None, None]);
        assert!(topo.vertex_boundary.iter().all(|&b| b));
        assert_eq!(topo.vertex_neighbours[0], vec![1, 2, 3]);
    }

    #[test]
    fn test_grid_interior_vertex() {
        let mesh = grid_mesh(2);
        let topo = MeshTopology::new(&mesh);
        assert!(!topo.vertex_boundary[4]);
        assert!(topo.vertex_boundary[0]);
        assert_eq!(topo.vertex_faces[4].len(), 6);
        for f in 0..mesh.faces.len() {
            for g in topo.neighbouring_faces(f) {
                assert!(topo.neighbouring_faces(g).any(|h| h == f));
            }
        }
    }

    #[test]
    fn test_shared_edge() {
        let mesh = quad_mesh();
        let (l0, l1) = shared_edge(&mesh, 0, 1).unwrap();
        for i in 0..2 {
            assert_eq!(mesh.faces[0][l0[i]], mesh.faces[1][l1[i]]);
        }
        let mesh = grid_mesh(2);
        assert!(shared_edge(&mesh, 0, 7).is_none());
    }

    #[test]
    fn test_face_normals() {
        let mut mesh = quad_mesh();
        for n in mesh.face_normals() {
            assert_eq!(n, Vector3::new(0.0, 0.0, 1.0));
        }
        mesh.faces.push([0, 0, 1]);
        assert_eq!(mesh.face_normal(2), Vector3::zeros());
        assert!(mesh.validate().is_ok());
        mesh.faces.push([0, 1, 9]);
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_smooth_face_normals_keeps_flat_surface() {
        let mesh = grid_mesh(3);
        let topo = MeshTopology::new(&mesh);
        let normals = smooth_face_normals(&mesh.face_normals(), &topo, 25.0, 0.5, 3);
        for n in normals {
            assert!((n - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-12);
        }
    }
}
