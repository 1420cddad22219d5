use std::collections::hash_map::Entry::Vacant;
use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::info;

use base::defs::{IntoResult, Result};
use base::util::fs;

use crate::texture::{TexturedMesh, Vector2};

fn material_name(atlas_idx: usize) -> String {
    format!("material_{}", atlas_idx)
}

/// Texture coordinates normalized to [0, 1] (v pointing up), deduplicated.
pub fn compress_uv_coords(tmesh: &TexturedMesh) -> (Vec<Vector2>, Vec<[usize; 3]>) {
    const EPS: f64 = 1e-6; // Round coordinates to this size, then merge them.
    let mut unique: HashMap<[i64; 2], usize> = HashMap::new();
    let mut ordered: Vec<Vector2> = vec![];
    let mut idxs: Vec<[usize; 3]> = Vec::with_capacity(tmesh.uv_coords.len());

    for (uvs, &atlas_idx) in tmesh.uv_coords.iter().zip(&tmesh.face_atlases) {
        let size = tmesh.atlases[atlas_idx].width() as f64;
        let mut face_idxs = [0; 3];
        for (k, uv) in uvs.iter().enumerate() {
            // Pixel centers sit at integer coordinates.
            let u = (uv[0] + 0.5) / size;
            let v = 1.0 - (uv[1] + 0.5) / size;
            let key = [(u / EPS).round() as i64, (v / EPS).round() as i64];
            if let Vacant(e) = unique.entry(key) {
                e.insert(ordered.len());
                ordered.push(Vector2::new(key[0] as f64 * EPS, key[1] as f64 * EPS));
            }
            face_idxs[k] = unique[&key];
        }
        idxs.push(face_idxs);
    }

    (ordered, idxs)
}

fn write_mtl<W: Write>(writer: &mut W, texture_names: &[String]) -> io::Result<()> {
    for (atlas_idx, name) in texture_names.iter().enumerate() {
        writeln!(writer, "newmtl {}", material_name(atlas_idx))?;
        writeln!(writer, "Ka 1.000000 1.000000 1.000000")?;
        writeln!(writer, "Kd 1.000000 1.000000 1.000000")?;
        writeln!(writer, "Ks 0.000000 0.000000 0.000000")?;
        writeln!(writer, "Tr 0.000000")?;
        writeln!(writer, "illum 1")?;
        writeln!(writer, "Ns 1.000000")?;
        writeln!(writer, "map_Kd {}", name)?;
        writeln!(writer)?;
    }
    Ok(())
}

fn write_obj<W: Write>(writer: &mut W, tmesh: &TexturedMesh, mtl_name: &str) -> io::Result<()> {
    let mesh = &tmesh.mesh;
    writeln!(writer, "mtllib {}", mtl_name)?;
    for v in &mesh.vertices {
        writeln!(writer, "v {:.6} {:.6} {:.6}", v[0], v[1], v[2])?;
    }
    let (uvs, uv_idxs) = compress_uv_coords(tmesh);
    for vt in &uvs {
        writeln!(writer, "vt {:.6} {:.6}", vt[0], vt[1])?;
    }
    let with_normals = !mesh.normals.is_empty();
    for vn in &mesh.normals {
        writeln!(writer, "vn {:.4} {:.4} {:.4}", vn[0], vn[1], vn[2])?;
    }

    for atlas_idx in 0..tmesh.atlases.len() {
        writeln!(writer, "usemtl {}", material_name(atlas_idx))?;
        let faces = mesh
            .faces
            .iter()
            .zip(&uv_idxs)
            .zip(&tmesh.face_atlases)
            .filter(|(_, &a)| a == atlas_idx);
        for ((f, t), _) in faces {
            // Indexing starts at 1.
            if with_normals {
                writeln!(
                    writer,
                    "f {}/{}/{} {}/{}/{} {}/{}/{}",
                    f[0] + 1,
                    t[0] + 1,
                    f[0] + 1,
                    f[1] + 1,
                    t[1] + 1,
                    f[1] + 1,
                    f[2] + 1,
                    t[2] + 1,
                    f[2] + 1,
                )?;
            } else {
                writeln!(
                    writer,
                    "f {}/{} {}/{} {}/{}",
                    f[0] + 1,
                    t[0] + 1,
                    f[1] + 1,
                    t[1] + 1,
                    f[2] + 1,
                    t[2] + 1,
                )?;
            }
        }
    }
    Ok(())
}

/// Writes `<name>.obj`, `<name>.mtl` and one `<name>_<atlas>.png` per atlas.
pub fn export_obj<P: AsRef<Path>>(tmesh: &TexturedMesh, obj_path: P) -> Result<()> {
    let obj_path = obj_path.as_ref();
    info!("exporting textured mesh to '{}'...", obj_path.display());

    let mut texture_names = Vec::with_capacity(tmesh.atlases.len());
    for (atlas_idx, atlas) in tmesh.atlases.iter().enumerate() {
        let path = fs::sibling_path(obj_path, &format!("_{}", atlas_idx), "png")?;
        fs::create_file(&path)?;
        atlas
            .save(&path)
            .res(|| format!("failed to save texture '{}'", path.display()))?;
        texture_names.push(fs::file_name(&path)?);
    }

    let mtl_path = fs::sibling_path(obj_path, "", "mtl")?;
    let mut writer = BufWriter::new(fs::create_file(&mtl_path)?);
    write_mtl(&mut writer, &texture_names)
        .and_then(|_| writer.flush())
        .res(|| format!("failed to write '{}'", mtl_path.display()))?;

    let mut writer = BufWriter::new(fs::create_file(obj_path)?);
    write_obj(&mut writer, tmesh, &fs::file_name(&mtl_path)?)
        .and_then(|_| writer.flush())
        .res(|| format!("failed to write '{}'", obj_path.display()))?;

    info!("  {} texture file(s) written", texture_names.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::test::quad_mesh;
    use base::util::test::*;

    fn textured_quad() -> TexturedMesh {
        TexturedMesh {
            mesh: quad_mesh(),
            uv_coords: vec![
                [Vector2::new(0.0, 0.0), Vector2::new(3.0, 0.0), Vector2::new(3.0, 3.0)],
                [Vector2::new(0.0, 0.0), Vector2::new(3.0, 3.0), Vector2::new(1.5, 1.5)],
            ],
            face_atlases: vec![0, 1],
            atlases: vec![flat_image(4, 4, [0, 0, 0]), flat_image(8, 8, [0, 0, 0])],
        }
    }

    #[test]
    fn test_compress_uv_coords() {
        let (uvs, idxs) = compress_uv_coords(&textured_quad());
        // Both faces share (0, 0) and (3, 3) in pixels, but not in
        // normalized coordinates since their atlases differ in size.
        assert_eq!(uvs.len(), 6);
        assert_ne!(idxs[0][0], idxs[1][0]);
        assert_eq_f64!(uvs[idxs[0][1]][0], 0.875);
        assert_eq_f64!(uvs[idxs[0][1]][1], 0.875);
        assert_eq_f64!(uvs[idxs[1][0]][0], 0.0625);
        assert_eq_f64!(uvs[idxs[1][0]][1], 0.9375);
    }

    #[test]
    fn test_write_obj() {
        let mut tmesh = textured_quad();
        tmesh.mesh.normals.clear();
        let mut out = Vec::new();
        write_obj(&mut out, &tmesh, "quad.mtl").unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "mtllib quad.mtl");
        assert_eq!(lines.iter().filter(|l| l.starts_with("v ")).count(), 4);
        assert_eq!(lines.iter().filter(|l| l.starts_with("vt ")).count(), 6);
        let material = lines.iter().position(|l| *l == "usemtl material_1").unwrap();
        assert_eq!(lines[material + 1], "f 1/4 3/5 4/6");

        let mut mtl = Vec::new();
        write_mtl(&mut mtl, &["quad_0.png".to_string()]).unwrap();
        let mtl = String::from_utf8(mtl).unwrap();
        assert!(mtl.contains("newmtl material_0\n"));
        assert!(mtl.contains("map_Kd quad_0.png\n"));
    }
}
