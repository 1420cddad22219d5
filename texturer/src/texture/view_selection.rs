use log::info;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rand::Rng;

use base::defs::Result;

use crate::texture::*;

const QUALITY_HISTOGRAM_BINS: usize = 1000;
const QUALITY_PERCENTILE: f64 = 0.95;

/// Faces connected across edges where both sides are seen by some view.
/// Edges between a seen and an unseen face are kept apart as seams.
pub struct FaceGraph {
    pub graph: UnGraph<(), ()>,
    pub seam_edges: Vec<[usize; 2]>,
}

impl FaceGraph {
    pub fn new(topo: &MeshTopology, faces_datas: &[FaceDataArr]) -> FaceGraph {
        let num_faces = faces_datas.len();
        let mut graph = UnGraph::with_capacity(num_faces, num_faces * 3 / 2);
        for _ in 0..num_faces {
            graph.add_node(());
        }
        let mut seam_edges = vec![];
        for face_idx in 0..num_faces {
            for adj in topo.neighbouring_faces(face_idx) {
                if adj <= face_idx {
                    continue;
                }
                match (faces_datas[face_idx].is_empty(), faces_datas[adj].is_empty()) {
                    (false, false) => {
                        graph.add_edge(NodeIndex::new(face_idx), NodeIndex::new(adj), ());
                    }
                    (true, true) => {}
                    _ => seam_edges.push([face_idx, adj]),
                }
            }
        }
        FaceGraph { graph, seam_edges }
    }

    pub fn edges(&self) -> Vec<[usize; 2]> {
        self.graph
            .edge_references()
            .map(|e| [e.source().index(), e.target().index()])
            .collect()
    }
}

/// Approximate percentile of non-negative values from a fixed-size
/// histogram; reports the upper edge of the bin reaching the percentile.
pub fn quality_percentile(qualities: &[f64], percentile: f64) -> f64 {
    let max = qualities.iter().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return 0.0;
    }
    let mut histogram = vec![0usize; QUALITY_HISTOGRAM_BINS];
    for &q in qualities {
        let bin = (q / max * QUALITY_HISTOGRAM_BINS as f64) as usize;
        histogram[bin.min(QUALITY_HISTOGRAM_BINS - 1)] += 1;
    }
    let target = percentile * qualities.len() as f64;
    let mut count = 0;
    for (bin, &n) in histogram.iter().enumerate() {
        count += n;
        if count as f64 >= target {
            return (bin + 1) as f64 * max / QUALITY_HISTOGRAM_BINS as f64;
        }
    }
    max
}

fn normalized_quality(quality: f64, norm: f64) -> f64 {
    if quality >= norm {
        1.0
    } else {
        quality / norm
    }
}

/// Label 0 is the undefined view, label `v + 1` is view `v`.
fn labeling_problem(
    nodes_datas: &[FaceDataArr],
    edges: Vec<[usize; 2]>,
    num_views: usize,
    smoothness_ratio: f64,
) -> LabelingProblem {
    let qualities: Vec<f64> = nodes_datas
        .iter()
        .flat_map(|datas| datas.iter().map(|d| d.quality))
        .collect();
    let norm = quality_percentile(&qualities, QUALITY_PERCENTILE);
    let max_energy = smoothness_ratio * MAX_ENERGY;

    let mut problem = LabelingProblem::new(nodes_datas.len(), num_views + 1);
    for (node, datas) in nodes_datas.iter().enumerate() {
        if datas.is_empty() {
            problem.set_data_cost(node, 0, max_energy);
        }
        for data in datas {
            let cost = (1.0 - normalized_quality(data.quality, norm)) * max_energy;
            problem.set_data_cost(node, data.view + 1, cost);
        }
    }
    problem.edges = edges;
    problem
}

fn to_view(label: usize) -> Option<usize> {
    label.checked_sub(1)
}

/// Assigns a view (or none) to every face.
#[allow(clippy::too_many_arguments)]
pub fn select_views<R: Rng>(
    mesh: &Mesh,
    topo: &MeshTopology,
    face_normals: &[Vector3],
    face_graph: &FaceGraph,
    faces_datas: &[FaceDataArr],
    camera_centers: &[Point3],
    params: &TextureParams,
    minimizer: &dyn EnergyMinimizer,
    rng: &mut R,
) -> Result<Vec<Option<usize>>> {
    let num_views = camera_centers.len();
    let labels: Vec<Option<usize>> = if params.min_common_cameras > 0 {
        info!("  grouping faces into virtual faces...");
        let virtual_faces = VirtualFaces::new(
            mesh,
            topo,
            face_normals,
            faces_datas,
            camera_centers,
            params.min_common_cameras,
            params.virtual_face_max_angle,
            rng,
        );
        let edges = virtual_faces
            .adjacency(topo)
            .into_iter()
            .filter(|&[a, b]| {
                !virtual_faces.datas[a].is_empty() && !virtual_faces.datas[b].is_empty()
            })
            .collect();
        let problem =
            labeling_problem(&virtual_faces.datas, edges, num_views, params.smoothness_ratio);
        let virtual_labels = minimizer.minimize(&problem)?;
        virtual_faces
            .face_to_virtual
            .iter()
            .map(|&vf| to_view(virtual_labels[vf]))
            .collect()
    } else {
        let problem = labeling_problem(
            faces_datas,
            face_graph.edges(),
            num_views,
            params.smoothness_ratio,
        );
        minimizer
            .minimize(&problem)?
            .into_iter()
            .map(to_view)
            .collect()
    };

    let undefined = labels.iter().filter(|l| l.is_none()).count();
    info!(
        "  {} faces labeled, {:.1}% without view",
        labels.len(),
        100.0 * undefined as f64 / labels.len().max(1) as f64
    );
    Ok(labels)
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
            color: Vector3::new(128.0, 128.0, 128.0),
        }
    }

    #[test]
    fn test_quality_percentile() {
        let qualities: Vec<f64> = (1..=100).map(|q| q as f64).collect();
        let p = quality_percentile(&qualities, 0.95);
        assert!((p - 95.0).abs() < 0.2, "{}", p);
        assert_eq!(quality_percentile(&[0.0, 0.0], 0.95), 0.0);
        assert_eq!(normalized_quality(3.0, 0.0), 1.0);
        assert_eq!(normalized_quality(1.0, 4.0), 0.25);
    }

    #[test]
    fn test_face_graph_seams() {
        let mesh = grid_mesh(1);
        let topo = MeshTopology::new(&mesh);
        let graph = FaceGraph::new(&topo, &[vec![data(0, 1.0)], vec![data(0, 1.0)]]);
        assert_eq!(graph.edges(), vec![[0, 1]]);
        assert!(graph.seam_edges.is_empty());

        let graph = FaceGraph::new(&topo, &[vec![data(0, 1.0)], vec![]]);
        assert!(graph.edges().is_empty());
        assert_eq!(graph.seam_edges, vec![[0, 1]]);
    }

    fn grid_datas(num_faces: usize) -> Vec<FaceDataArr> {
        // View 1 is slightly better on one face only; smoothness keeps the
        // labeling uniform.
        (0..num_faces)
            .map(|f| {
                if f == 3 {
                    vec![data(0, 0.9), data(1, 1.0)]
                } else {
                    vec![data(0, 1.0), data(1, 0.5)]
                }
            })
            .collect()
    }

    #[test]
    fn test_select_views_prefers_coherent_labels() {
        let mesh = grid_mesh(2);
        let topo = MeshTopology::new(&mesh);
        let normals = mesh.face_normals();
        let mut datas = grid_datas(mesh.faces.len());
        datas[7].clear();
        let graph = FaceGraph::new(&topo, &datas);
        let centers = vec![Point3::new(0.5, 0.5, 2.0), Point3::new(0.6, 0.5, 2.0)];
        let params = TextureParams {
            smoothness_ratio: 1.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let labels = select_views(
            &mesh,
            &topo,
            &normals,
            &graph,
            &datas,
            &centers,
            &params,
            &LoopyBeliefPropagation::default(),
            &mut rng,
        )
        .unwrap();
        for (f, label) in labels.iter().enumerate() {
            if f == 7 {
                assert_eq!(*label, None);
            } else {
                assert_eq!(*label, Some(0));
            }
        }
    }

    #[test]
    fn test_select_views_with_virtual_faces() {
        let mesh = grid_mesh(2);
        let topo = MeshTopology::new(&mesh);
        let normals = mesh.face_normals();
        let datas = grid_datas(mesh.faces.len());
        let graph = FaceGraph::new(&topo, &datas);
        let centers = vec![Point3::new(0.5, 0.5, 2.0), Point3::new(0.6, 0.5, 2.0)];
        let params = TextureParams {
            min_common_cameras: 2,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let labels = select_views(
            &mesh,
            &topo,
            &normals,
            &graph,
            &datas,
            &centers,
            &params,
            &LoopyBeliefPropagation::default(),
            &mut rng,
        )
        .unwrap();
        // The whole planar grid forms one virtual face.
        assert!(labels.iter().all(|l| *l == Some(0)));
    }
}
