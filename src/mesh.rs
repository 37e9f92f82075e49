//! Reference mesh loading and intersection testing.

extern crate cgmath;
extern crate embree_rs;
extern crate tobj;

use cgmath::prelude::*;
use cgmath::{Point3, Vector3, Vector4};

use std::path::{Path, PathBuf};

use crate::Error;

/// Load an OBJ file as a set of triangle models.
pub fn load_models(path: &Path) -> Result<Vec<tobj::Model>, Error> {
    if !path.exists() {
        return Err(Error::MissingInput(format!("mesh {}", path.display())));
    }
    let (models, _) = tobj::load_obj(path)
        .map_err(|e| Error::ParseError(format!("could not load {}: {:?}", path.display(), e)))?;
    Ok(models)
}

/// Find the reference mesh in a dataset folder: the first file named
/// `mesh_*.obj` in name order.
pub fn find_mesh(folder: &Path) -> Result<PathBuf, Error> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.starts_with("mesh_") && name.ends_with(".obj")
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::MissingInput(format!("mesh_*.obj in {}", folder.display())))
}

/// Convert a 3D model into geometry for fast intersection tests.
pub fn model_to_geometry<'a>(
    model: &tobj::Model,
    dev: &'a embree_rs::Device,
) -> embree_rs::Geometry<'a> {
    let num_tri = model.mesh.indices.len() / 3;
    let num_vert = model.mesh.positions.len() / 3;
    let mut mesh = embree_rs::TriangleMesh::unanimated(dev, num_tri, num_vert);

    {
        let mut verts = mesh.vertex_buffer.map();
        let mut tris = mesh.index_buffer.map();
        for i in 0..num_tri {
            tris[i] = Vector3::new(
                model.mesh.indices[i * 3],
                model.mesh.indices[i * 3 + 1],
                model.mesh.indices[i * 3 + 2],
            );
        }
        for i in 0..num_vert {
            verts[i] = Vector4::new(
                model.mesh.positions[i * 3],
                model.mesh.positions[i * 3 + 1],
                model.mesh.positions[i * 3 + 2],
                0.0,
            );
        }
    }

    let mut geo = embree_rs::Geometry::Triangle(mesh);
    geo.commit();
    geo
}

/// First intersection of a ray with the scene, if any.
pub fn first_hit(
    scene: &embree_rs::CommittedScene,
    intersection_ctx: &mut embree_rs::IntersectContext,
    origin: Point3<f64>,
    dir: Vector3<f64>,
) -> Option<Point3<f64>> {
    let ray = embree_rs::Ray::new(
        origin.cast::<f32>().unwrap().to_vec(),
        dir.cast::<f32>().unwrap(),
    );
    let mut ray_hit = embree_rs::RayHit::new(ray);
    scene.intersect(intersection_ctx, &mut ray_hit);
    if ray_hit.hit.hit() {
        Some(origin + dir * ray_hit.ray.tfar as f64)
    } else {
        None
    }
}
