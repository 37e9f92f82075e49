extern crate assert_cmd;
extern crate embree_rs;
extern crate nalgebra as na;
extern crate predicates;
extern crate rnb2neus;
extern crate serde_json;
extern crate tempfile;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

use na::{Matrix3, Matrix4, Vector3, U1, U3};

use rnb2neus::archive::{self, CameraArchive, CameraRecord};
use rnb2neus::camera::{decompose_projection, ViewCamera};
use rnb2neus::images::{self, BitDepth, Raster};
use rnb2neus::manifest::TransformManifest;
use rnb2neus::mesh;

const RES: usize = 96;
const FOCAL: f64 = 96.0;
const RADIUS: f64 = 3.0;

/// Axis-aligned unit cube centered at the origin, as explicit triangles.
fn write_cube_obj(path: &Path) {
    let mut file = File::create(path).unwrap();
    let verts = [
        [-0.5, -0.5, -0.5],
        [0.5, -0.5, -0.5],
        [0.5, 0.5, -0.5],
        [-0.5, 0.5, -0.5],
        [-0.5, -0.5, 0.5],
        [0.5, -0.5, 0.5],
        [0.5, 0.5, 0.5],
        [-0.5, 0.5, 0.5],
    ];
    for v in verts.iter() {
        writeln!(file, "v {} {} {}", v[0], v[1], v[2]).unwrap();
    }
    let faces = [
        [1, 2, 3],
        [1, 3, 4],
        [5, 7, 6],
        [5, 8, 7],
        [1, 5, 6],
        [1, 6, 2],
        [4, 3, 7],
        [4, 7, 8],
        [1, 4, 8],
        [1, 8, 5],
        [2, 6, 7],
        [2, 7, 3],
    ];
    for f in faces.iter() {
        writeln!(file, "f {} {} {}", f[0], f[1], f[2]).unwrap();
    }
}

/// World-to-image projection of a camera at `center` looking at the origin,
/// OpenCV convention (y down, z toward the scene).
fn look_at_projection(center: Vector3<f64>) -> Matrix4<f64> {
    let z = (-center).normalize();
    let up = Vector3::new(0.0, 1.0, 0.0);
    let x = z.cross(&up).normalize();
    let y = z.cross(&x);

    let mut r = Matrix3::zeros();
    r.row_mut(0).copy_from(&x.transpose());
    r.row_mut(1).copy_from(&y.transpose());
    r.row_mut(2).copy_from(&z.transpose());

    let half = RES as f64 / 2.0;
    let k = Matrix3::new(FOCAL, 0.0, half, 0.0, FOCAL, half, 0.0, 0.0, 1.0);
    let t = -(r * center);

    let mut p = Matrix4::identity();
    p.fixed_slice_mut::<U3, U3>(0, 0).copy_from(&(k * r));
    p.fixed_slice_mut::<U3, U1>(0, 3).copy_from(&(k * t));
    p
}

fn ring_archive(n: usize) -> CameraArchive {
    let records = (0..n)
        .map(|i| {
            let angle = i as f64 / n as f64 * 2.0 * std::f64::consts::PI;
            let center = Vector3::new(RADIUS * angle.cos(), 0.0, RADIUS * angle.sin());
            CameraRecord::Minimal {
                world_mat: look_at_projection(center),
                scale_mat: None,
            }
        })
        .collect();
    CameraArchive::new(records)
}

/// Render per-view albedo maps of the cube by ray casting, with the mask in
/// the alpha channel. `scales` injects a per-view albedo distortion.
fn render_ring_dataset(root: &Path, scales: &[[f64; 3]]) {
    let n = scales.len();
    let dataset = root.join("ring");
    let albedo_dir = dataset.join("albedos");
    let normal_dir = dataset.join("normals");
    std::fs::create_dir_all(&albedo_dir).unwrap();
    std::fs::create_dir_all(&normal_dir).unwrap();

    let archive = ring_archive(n);
    archive.write(&root.join("cameras.npz")).unwrap();

    let mesh_path = dataset.join("mesh_cube.obj");
    write_cube_obj(&mesh_path);
    let models = mesh::load_models(&mesh_path).unwrap();
    let dev = embree_rs::Device::new();
    let mut scene = embree_rs::Scene::new(&dev);
    for model in models.iter() {
        scene.attach_geometry(mesh::model_to_geometry(model, &dev));
    }
    let cscene = scene.commit();

    for (i, record) in archive.iter().enumerate() {
        let (intrinsics, pose) = decompose_projection(&record.world_projection()).unwrap();
        let camera = ViewCamera::new(&intrinsics, &pose);

        let mut raster = Raster::new(RES, RES, 4);
        let mut intersection_ctx = embree_rs::IntersectContext::coherent();
        for y in 0..RES {
            for x in 0..RES {
                let (origin, dir) = camera.pixel_ray(x as f64, y as f64);
                if mesh::first_hit(&cscene, &mut intersection_ctx, origin, dir).is_some() {
                    for c in 0..3 {
                        raster.set(x, y, c, (0.5 * scales[i][c]) as f32);
                    }
                    raster.set(x, y, 3, 1.0);
                }
            }
        }
        images::save_image(
            &albedo_dir.join(format!("{:03}.png", i)),
            &raster,
            BitDepth::Sixteen,
        )
        .unwrap();
        // placeholder normals so the output copy has something to carry over
        images::save_image(
            &normal_dir.join(format!("{:03}.png", i)),
            &raster,
            BitDepth::Sixteen,
        )
        .unwrap();
    }

    TransformManifest::new(RES as u32, RES as u32, &Matrix4::identity())
        .write(&dataset.join("transform.json"))
        .unwrap();
}

/// Four views around a cube with view 2 pre-scaled by (2,1,1): the estimator
/// must undo the injected scale relative to the other views.
#[test]
fn ring_albedo_scaling() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let scales = [
        [1.0, 1.0, 1.0],
        [1.0, 1.0, 1.0],
        [2.0, 1.0, 1.0],
        [1.0, 1.0, 1.0],
    ];
    render_ring_dataset(dir.path(), &scales);

    let mut cmd = Command::cargo_bin("scale_albedos")?;
    cmd.arg(dir.path().join("ring"));
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Scale ratios to apply to each albedo"));

    let output = dir.path().join("ring-albedoscaled");
    let ratios = archive::read_npy_file(&output.join("ratios.npy"))?;
    assert_eq!(ratios.shape, vec![4, 3]);
    let ratio = |view: usize, c: usize| ratios.data[view * 3 + c];

    // red correction of view 2 is about half that of its neighbors
    assert!((ratio(2, 0) / ratio(0, 0) - 0.5).abs() < 0.05 * 0.5);
    // green and blue corrections stay flat across the ring
    for view in 0..4 {
        for c in 1..3 {
            assert!(
                (ratio(view, c) / ratio(0, c) - 1.0).abs() < 0.05,
                "view {} channel {}: {} vs {}",
                view,
                c,
                ratio(view, c),
                ratio(0, c)
            );
        }
    }

    // the corrected images agree across views on their overlapping surface
    let medians: Vec<f32> = (0..4)
        .map(|i| {
            let (raster, _) =
                images::load_image(&output.join("albedos").join(format!("{:03}.png", i))).unwrap();
            let mask = raster.alpha().unwrap();
            let mut reds: Vec<f32> = mask
                .nonzero_pixels()
                .into_iter()
                .map(|(x, y)| raster.get(x, y, 0))
                .collect();
            reds.sort_by(|a, b| a.partial_cmp(b).unwrap());
            reds[reds.len() / 2]
        })
        .collect();
    for m in &medians {
        assert!(
            (m / medians[0] - 1.0).abs() < 0.05,
            "corrected medians disagree: {:?}",
            medians
        );
    }

    Ok(())
}

/// Small non-ray-cast dataset for the conversion tools: rectangle masks and
/// flat normal maps.
fn flat_dataset(root: &Path, n: usize) {
    let normal_dir = root.join("normal");
    let mask_dir = root.join("mask");
    std::fs::create_dir_all(&normal_dir).unwrap();
    std::fs::create_dir_all(&mask_dir).unwrap();

    ring_archive(n).write(&root.join("cameras.npz")).unwrap();

    for i in 0..n {
        let mut normal = Raster::new(RES, RES, 3);
        for y in 0..RES {
            for x in 0..RES {
                normal.set(x, y, 0, 0.5);
                normal.set(x, y, 1, 0.5);
                normal.set(x, y, 2, 0.0);
            }
        }
        images::save_image(
            &normal_dir.join(format!("{:03}.png", i)),
            &normal,
            BitDepth::Eight,
        )
        .unwrap();

        let mut mask = Raster::new(RES, RES, 1);
        for y in 4..16 {
            for x in 8..24 {
                mask.set(x, y, 0, 1.0);
            }
        }
        images::save_image(
            &mask_dir.join(format!("{:03}.png", i)),
            &mask,
            BitDepth::Eight,
        )
        .unwrap();
    }
}

#[test]
fn convert_to_neus2_layout() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    flat_dataset(dir.path(), 4);

    let mut cmd = Command::cargo_bin("rnb2neus")?;
    cmd.arg(dir.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("-DONE-"));

    let output = dir.path().join("RNb-NeuS2");
    let manifest = TransformManifest::read(&output.join("transform.json"))?;
    assert_eq!(manifest.frames.len(), 4);
    assert_eq!(manifest.w, RES as u32);
    assert_eq!(manifest.h, RES as u32);
    assert!(manifest.from_na);
    assert_eq!(
        manifest.frames[0].albedo_path.as_deref(),
        Some("albedos/000.png")
    );

    // packed outputs carry the mask in the alpha channel
    let (albedo, _) = images::load_image(&output.join("albedos").join("000.png"))?;
    assert_eq!(albedo.channels(), 4);
    let mask = albedo.alpha().unwrap();
    assert_eq!(mask.nonzero_pixels().len(), 16 * 12);

    Ok(())
}

#[test]
fn select_subset_of_views() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    flat_dataset(dir.path(), 4);
    let out = dir.path().join("subset");

    let mut cmd = Command::cargo_bin("select")?;
    cmd.arg("--data-path")
        .arg(dir.path())
        .arg("--output-path")
        .arg(&out)
        .arg("--ind-images")
        .arg("2")
        .arg("0");
    cmd.assert().success();

    let original = CameraArchive::read(&dir.path().join("cameras.npz"))?;
    let subset = CameraArchive::read(&out.join("cameras.npz"))?;
    assert_eq!(subset.len(), 2);
    assert_eq!(subset.records[0].world_mat(), original.records[2].world_mat());
    assert_eq!(subset.records[1].world_mat(), original.records[0].world_mat());
    assert!(out.join("normal").join("000.png").exists());
    assert!(out.join("mask").join("001.png").exists());

    Ok(())
}

#[test]
fn crop_to_union_mask_bbox() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    flat_dataset(dir.path(), 3);
    let out = dir.path().join("cropped");

    let mut cmd = Command::cargo_bin("crop")?;
    cmd.arg(dir.path()).arg(&out);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Crop box"));

    // masks span x 8..=23, y 4..=15; the crop keeps up to the last full row
    let (image, _) = images::load_image(&out.join("image").join("00000000.png"))?;
    assert_eq!(image.width(), 15);
    assert_eq!(image.height(), 11);

    // the rewritten projections decompose with the shifted principal point
    let cropped = CameraArchive::read(&out.join("cameras.npz"))?;
    assert_eq!(cropped.len(), 3);
    let (intrinsics, _) = decompose_projection(&cropped.records[0].world_projection())?;
    assert!((intrinsics[(0, 2)] - (RES as f64 / 2.0 - 8.0)).abs() < 1e-6);
    assert!((intrinsics[(1, 2)] - (RES as f64 / 2.0 - 4.0)).abs() < 1e-6);

    Ok(())
}

#[test]
fn shade_with_fixed_lights() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    flat_dataset(dir.path(), 2);

    let mut cmd = Command::cargo_bin("shade")?;
    cmd.arg(dir.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Finished."));

    let output = dir.path().join("shaded");
    let manifest = TransformManifest::read(&output.join("transform.json"))?;
    assert_eq!(manifest.frames.len(), 2 * 3);
    for frame in &manifest.frames {
        let light = frame.light.expect("shaded frames carry a light");
        let norm = (light[0] * light[0] + light[1] * light[1] + light[2] * light[2]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!(frame.file_path.is_some());
    }
    assert!(output.join("images").join("000_000.png").exists());
    assert!(output.join("images").join("001_002.png").exists());

    Ok(())
}

#[test]
fn copy_scale_matrix_between_archives() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    let target = dir.path().join("cameras.npz");
    ring_archive(3).write(&target)?;

    let scale = Matrix4::identity() * 0.25;
    let donor_path = dir.path().join("donor.npz");
    let donor = CameraArchive::new(vec![CameraRecord::Minimal {
        world_mat: Matrix4::identity(),
        scale_mat: Some(scale),
    }]);
    donor.write(&donor_path)?;

    let mut cmd = Command::cargo_bin("copyscale")?;
    cmd.arg("--cameras-npz")
        .arg(&target)
        .arg("--copy-npz")
        .arg(&donor_path);
    cmd.assert().success();

    let rewritten = CameraArchive::read(&target)?;
    assert_eq!(rewritten.len(), 3);
    for record in rewritten.iter() {
        assert_eq!(record.scale_mat(), scale);
    }

    Ok(())
}

#[test]
fn cameras_to_json() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    ring_archive(4).write(&dir.path().join("cameras.npz"))?;

    let mut cmd = Command::cargo_bin("cam2json")?;
    cmd.arg(dir.path());
    cmd.assert().success();

    let contents = std::fs::read_to_string(dir.path().join("cameras.json"))?;
    let parsed: serde_json::Value = serde_json::from_str(&contents)?;
    assert_eq!(parsed["K"].as_array().unwrap().len(), 4);
    assert_eq!(parsed["R"].as_array().unwrap().len(), 4);
    assert_eq!(parsed["T"].as_array().unwrap().len(), 4);
    assert_eq!(parsed["R_euler"].as_array().unwrap().len(), 4);
    // T is stored as a column vector per view
    assert_eq!(parsed["T"][0].as_array().unwrap().len(), 3);

    Ok(())
}
