use log::info;
use petgraph::graph::NodeIndex;

use crate::texture::*;

/// Connected faces textured from the same view. The reserved last patch
/// collects all faces without a view.
#[derive(Clone, Debug)]
pub struct TexturePatch {
    pub label: Option<usize>,
    pub faces: Vec<usize>,
    pub rect: Rectangle<u32>,
}

impl TexturePatch {
    fn new(label: Option<usize>) -> TexturePatch {
        TexturePatch {
            label,
            faces: vec![],
            rect: Rectangle::new(0, 0, 0, 0),
        }
    }
}

pub struct Segmentation {
    pub patches: Vec<TexturePatch>,
    pub face_patches: Vec<usize>,
    pub seam_edges: Vec<[usize; 2]>,
}

impl Segmentation {
    pub fn reserved_patch(&self) -> usize {
        self.patches.len() - 1
    }
}

/// Splits the face graph along label changes and turns its components into
/// patches.
pub fn segment_patches(
    mut face_graph: FaceGraph,
    labels: &[Option<usize>],
    components: &dyn ConnectedComponents,
) -> Segmentation {
    let mut seam_edges = std::mem::take(&mut face_graph.seam_edges);
    let graph = &mut face_graph.graph;
    for e in graph.edge_indices() {
        if let Some((a, b)) = graph.edge_endpoints(e) {
            if labels[a.index()] != labels[b.index()] {
                seam_edges.push(ordered([a.index(), b.index()]));
            }
        }
    }
    graph.retain_edges(|g, e| match g.edge_endpoints(e) {
        Some((a, b)) => labels[a.index()] == labels[b.index()],
        None => false,
    });

    let num_faces = labels.len();
    let edges: Vec<[usize; 2]> = graph
        .edge_indices()
        .filter_map(|e| graph.edge_endpoints(e))
        .map(|(a, b): (NodeIndex, NodeIndex)| [a.index(), b.index()])
        .collect();
    let component_ids = components.components(num_faces, &edges);
    let num_components = component_ids.iter().map(|c| c + 1).max().unwrap_or(0);

    let mut component_patches: Vec<TexturePatch> = (0..num_components)
        .map(|_| TexturePatch::new(None))
        .collect();
    let mut reserved = TexturePatch::new(None);
    for (face_idx, &label) in labels.iter().enumerate() {
        match label {
            Some(_) => {
                let patch = &mut component_patches[component_ids[face_idx]];
                debug_assert!(patch.faces.is_empty() || patch.label == label);
                patch.label = label;
                patch.faces.push(face_idx);
            }
            None => reserved.faces.push(face_idx),
        }
    }

    // Compact away components of unlabeled faces.
    let mut component_to_patch = vec![0; num_components];
    let mut patches = Vec::with_capacity(num_components + 1);
    for (component, patch) in component_patches.into_iter().enumerate() {
        if patch.label.is_some() {
            component_to_patch[component] = patches.len();
            patches.push(patch);
        } else {
            component_to_patch[component] = usize::MAX;
        }
    }
    let reserved_idx = patches.len();
    for idx in component_to_patch.iter_mut().filter(|idx| **idx == usize::MAX) {
        *idx = reserved_idx;
    }
    patches.push(reserved);

    let face_patches = component_ids
        .iter()
        .map(|&c| component_to_patch[c])
        .collect();

    info!(
        "  created {} texture patches ({} faces without view)",
        patches.len() - 1,
        patches[reserved_idx].faces.len()
    );
    Segmentation {
        patches,
        face_patches,
        seam_edges,
    }
}
