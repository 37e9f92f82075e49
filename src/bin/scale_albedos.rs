//! Estimate and apply per-view albedo scale corrections for a NeuS2-style
//! dataset, using cross-view consistency against a reconstructed mesh.
//!
//! Reads `<folder>/albedos/*.png` (albedo + mask alpha), the projection
//! matrices from `<folder>/../cameras.npz`, and a mesh; writes the corrected
//! dataset to a sibling `<folder>-albedoscaled` with the ratio array saved
//! alongside for auditing.

extern crate embree_rs;
extern crate rnb2neus;
extern crate structopt;

use structopt::StructOpt;

use std::path::{Path, PathBuf};

use rnb2neus::albedo::{estimate_scale_ratios, ScaleConfig};
use rnb2neus::archive::{self, CameraArchive};
use rnb2neus::camera::{decompose_projection, ViewCamera};
use rnb2neus::images::{self, BitDepth, Raster};
use rnb2neus::mesh;
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "scale_albedos")]
struct Opt {
    /// Dataset folder holding albedos/, normals/, and transform.json; the
    /// camera archive is read from its parent.
    #[structopt(name = "FOLDER", parse(from_os_str))]
    folder: PathBuf,

    /// Reconstructed mesh; defaults to the first mesh_*.obj in the folder.
    #[structopt(long = "mesh", parse(from_os_str))]
    mesh: Option<PathBuf>,

    /// Per-view sample budget.
    #[structopt(long = "samples", default_value = "2000")]
    samples: usize,

    /// Derive the budget from the mask sizes instead of --samples.
    #[structopt(long = "budget-from-masks")]
    budget_from_masks: bool,

    /// Seed for the per-view pixel samplers.
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    /// Fail when a view yields no usable cross-view samples instead of
    /// assuming a unit ratio.
    #[structopt(long = "strict")]
    strict: bool,
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    let opt = Opt::from_args();

    let folder = &opt.folder;
    let mesh_path = match &opt.mesh {
        Some(path) => path.clone(),
        None => mesh::find_mesh(folder)?,
    };
    let albedo_dir = folder.join("albedos");
    let normal_dir = folder.join("normals");
    let transform_path = folder.join("transform.json");
    let parent = folder.parent().unwrap_or_else(|| Path::new("."));
    let cameras_path = parent.join("cameras.npz");

    let exp_name = folder
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::MissingInput(format!("dataset folder {}", folder.display())))?;
    let output = parent.join(format!("{}-albedoscaled", exp_name));
    std::fs::create_dir_all(output.join("albedos"))?;
    std::fs::copy(&transform_path, output.join("transform.json"))?;
    copy_tree(&normal_dir, &output.join("normals"))?;

    // Load albedos with their masks in the alpha channel
    let albedo_paths = images::list_images(&albedo_dir)?;
    let n_views = albedo_paths.len();
    let mut albedos = Vec::with_capacity(n_views);
    let mut masks = Vec::with_capacity(n_views);
    for path in &albedo_paths {
        let (raster, _) = images::load_image(path)?;
        let mask = raster.alpha().ok_or_else(|| {
            Error::ParseError(format!("{} carries no mask alpha channel", path.display()))
        })?;
        albedos.push(raster.drop_alpha());
        masks.push(mask);
    }

    // Camera parameters come from the raw projection matrices
    let camera_archive = CameraArchive::read(&cameras_path)?;
    if camera_archive.len() < n_views {
        return Err(Error::MissingInput(format!(
            "{} albedo images but only {} cameras in {}",
            n_views,
            camera_archive.len(),
            cameras_path.display()
        )));
    }
    let cameras = camera_archive
        .iter()
        .take(n_views)
        .map(|record| {
            let (intrinsics, pose) = decompose_projection(&record.world_projection())?;
            Ok(ViewCamera::new(&intrinsics, &pose))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    println!("Loading mesh...");
    let models = mesh::load_models(&mesh_path)?;
    let dev = embree_rs::Device::new();
    let mut scene = embree_rs::Scene::new(&dev);
    for model in models.iter() {
        let geometry = mesh::model_to_geometry(model, &dev);
        scene.attach_geometry(geometry);
    }
    let cscene = scene.commit();

    println!("Computing ratios...");
    let config = ScaleConfig {
        sample_budget: opt.samples,
        budget_from_masks: opt.budget_from_masks,
        seed: opt.seed,
        strict: opt.strict,
        verbose: true,
        ..ScaleConfig::default()
    };
    let ratios = estimate_scale_ratios(&cscene, &cameras, &albedos, &masks, &config)?;
    println!("Scale ratios to apply to each albedo:");
    for (i, r) in ratios.iter().enumerate() {
        println!("  view {}: [{:.6}, {:.6}, {:.6}]", i, r.x, r.y, r.z);
    }

    let flat: Vec<f64> = ratios.iter().flat_map(|r| vec![r.x, r.y, r.z]).collect();
    archive::write_npy_file(&output.join("ratios.npy"), &[n_views, 3], &flat)?;

    println!("Scaling and saving albedos...");
    for (i, path) in albedo_paths.iter().enumerate() {
        let mut corrected: Raster = albedos[i].clone();
        corrected.scale_rgb([ratios[i].x, ratios[i].y, ratios[i].z]);
        let out_path = output
            .join("albedos")
            .join(path.file_name().unwrap());
        images::save_image(&out_path, &corrected.with_alpha(&masks[i]), BitDepth::Sixteen)?;
        println!("Saved {}", out_path.display());
    }

    Ok(())
}
