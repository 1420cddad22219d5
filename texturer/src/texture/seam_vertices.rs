use indexmap::IndexMap;
use log::info;

use crate::texture::*;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeamEdge {
    pub other: usize, // Seam vertex at the other end.
    pub face: usize,  // Face owning the edge in this patch.
}

/// A seam vertex as seen from one of the patches meeting at it.
#[derive(Clone, Debug)]
pub struct SeamPatch {
    pub patch: usize,
    pub proj: Vector2,
    pub edges: Vec<SeamEdge>,
}

#[derive(Clone, Debug)]
pub struct SeamVertex {
    pub vertex: usize,
    pub patches: Vec<SeamPatch>,
}

impl SeamVertex {
    fn patch_mut(&mut self, patch: usize, proj: Vector2) -> &mut SeamPatch {
        let idx = match self.patches.iter().position(|p| p.patch == patch) {
            Some(idx) => idx,
            None => {
                self.patches.push(SeamPatch {
                    patch,
                    proj,
                    edges: vec![],
                });
                self.patches.len() - 1
            }
        };
        &mut self.patches[idx]
    }

    pub fn patch(&self, patch: usize) -> Option<&SeamPatch> {
        self.patches.iter().find(|p| p.patch == patch)
    }
}

pub type SeamVertices = IndexMap<usize, SeamVertex>;

fn seam_index(seams: &mut SeamVertices, vertex: usize) -> usize {
    let entry = seams.entry(vertex);
    let idx = entry.index();
    entry.or_insert_with(|| SeamVertex {
        vertex,
        patches: vec![],
    });
    idx
}

/// Collects the vertices lying on seam edges between two distinct patches,
/// keyed by mesh vertex. The reserved patch never takes part.
pub fn create_seam_vertices(mesh: &Mesh, patched: &PatchedMesh) -> SeamVertices {
    let reserved = patched.reserved_patch();
    let mut seams = SeamVertices::new();
    for &[f0, f1] in &patched.seam_edges {
        let (p0, p1) = (patched.face_patches[f0], patched.face_patches[f1]);
        if p0 == p1 {
            continue;
        }
        let (l0, l1) = match shared_edge(mesh, f0, f1) {
            Some(locals) => locals,
            None => continue,
        };
        let vs = [mesh.faces[f0][l0[0]], mesh.faces[f0][l0[1]]];
        let s = [seam_index(&mut seams, vs[0]), seam_index(&mut seams, vs[1])];
        for (patch, face, locals) in [(p0, f0, l0), (p1, f1, l1)] {
            if patch == reserved {
                continue;
            }
            let uv = &patched.uv_coords[face];
            for k in 0..2 {
                let seam_patch = seams[s[k]].patch_mut(patch, uv[locals[k]]);
                seam_patch.edges.push(SeamEdge {
                    other: s[1 - k],
                    face,
                });
            }
        }
    }
    info!("  found {} seam vertices", seams.len());
    seams
}
