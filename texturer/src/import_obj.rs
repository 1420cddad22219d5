use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use log::{debug, info};

use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::fs;

use crate::mesh::{Mesh, Point3, Vector3};

const MAX_NUM_FACE_VERTICES: usize = 64;

#[derive(Default)]
struct ImportState {
    line: usize,
    mesh: Mesh,
    normals: Vec<Vector3>,
    vertex_normals: Vec<Option<Vector3>>,
    num_polygons: usize,
}

pub fn import_obj_file<P: AsRef<Path>>(path: P) -> Result<Mesh> {
    let path = path.as_ref();
    info!("importing mesh from '{}'...", path.display());
    let mesh = import_obj(fs::open_file(path)?)?;
    info!(
        "  {} vertices, {} faces",
        mesh.vertices.len(),
        mesh.faces.len()
    );
    Ok(mesh)
}

/// Reads vertices, vertex normals and faces; polygons are split into
/// triangle fans and every other statement is ignored.
pub fn import_obj<R: Read>(reader: R) -> Result<Mesh> {
    let mut state = ImportState::default();

    for line in BufReader::new(reader).lines() {
        let line = line.res(|| format!("failed to read line {}", state.line + 1))?;
        state.line += 1;

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.first() {
            Some(&"v") => import_v(&mut state, &parts)?,
            Some(&"vn") => import_vn(&mut state, &parts)?,
            Some(&"f") => import_f(&mut state, &parts)?,
            _ => (),
        }
    }

    if state.num_polygons > 0 {
        debug!("  triangulated {} polygons", state.num_polygons);
    }
    let ImportState {
        mut mesh,
        vertex_normals,
        ..
    } = state;
    if vertex_normals.iter().any(Option::is_some) {
        mesh.normals = vertex_normals
            .into_iter()
            .map(|n| n.unwrap_or_else(Vector3::zeros))
            .collect();
    }
    mesh.validate()?;
    Ok(mesh)
}

fn parse_coords<const N: usize>(state: &ImportState, parts: &[&str]) -> Result<[f64; N]> {
    let malformed = || {
        let desc = format!("malformed {}-statement at line {}", parts[0], state.line);
        Error::new(MalformedData, desc)
    };
    // Extra components (w, vertex colors) are ignored.
    if parts.len() < N + 1 {
        return Err(malformed());
    }
    let mut coords = [0.0; N];
    for (c, part) in coords.iter_mut().zip(&parts[1..]) {
        *c = part.parse::<f64>().map_err(|_| malformed())?;
    }
    Ok(coords)
}

fn import_v(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    let [x, y, z] = parse_coords::<3>(state, parts)?;
    state.mesh.vertices.push(Point3::new(x, y, z));
    state.vertex_normals.push(None);
    Ok(())
}

fn import_vn(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    let [x, y, z] = parse_coords::<3>(state, parts)?;
    state.normals.push(Vector3::new(x, y, z));
    Ok(())
}

/// Resolves a 1-based (or negative, relative) OBJ index.
fn resolve_index(index: &str, count: usize) -> Option<usize> {
    let index = index.parse::<i64>().ok()?;
    let resolved = if index > 0 {
        index - 1
    } else {
        count as i64 + index
    };
    if index != 0 && (0..count as i64).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

fn import_f(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    let num_vertices = parts.len() - 1;
    if num_vertices < 3 {
        let desc = format!("bad number of vertices in f-statement at line {}", state.line);
        return Err(Error::new(MalformedData, desc));
    } else if num_vertices > MAX_NUM_FACE_VERTICES {
        let desc = format!(
            "unsupported number of vertices in f-statement at line {}",
            state.line
        );
        return Err(Error::new(BadParameter, desc));
    }

    let mut face_vertices = Vec::with_capacity(num_vertices);
    for (i, part) in parts[1..].iter().enumerate() {
        let malformed = || {
            let desc = format!(
                "malformed vertex {} in f-statement at line {}",
                i + 1,
                state.line
            );
            Error::new(MalformedData, desc)
        };
        let mut iter = part.split('/');
        let vertex = iter
            .next()
            .and_then(|v| resolve_index(v, state.mesh.vertices.len()))
            .ok_or_else(malformed)?;
        let _texture = iter.next();
        let normal = match iter.next() {
            Some(n) if !n.is_empty() => {
                Some(resolve_index(n, state.normals.len()).ok_or_else(malformed)?)
            }
            _ => None,
        };
        if iter.next().is_some() {
            return Err(malformed());
        }
        if let Some(n) = normal {
            // The first normal seen for a vertex wins.
            state.vertex_normals[vertex].get_or_insert(state.normals[n]);
        }
        face_vertices.push(vertex);
    }

    for i in 1..num_vertices - 1 {
        state
            .mesh
            .faces
            .push([face_vertices[0], face_vertices[i], face_vertices[i + 1]]);
    }
    if num_vertices > 3 {
        state.num_polygons += 1;
    }
    Ok(())
}
