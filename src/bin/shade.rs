//! Render shaded images from decomposed normal/albedo maps under a fixed
//! three-light rig, and emit the NeuS2 transform.json with per-frame
//! world-space light directions.

extern crate rnb2neus;
extern crate structopt;

use structopt::StructOpt;

use std::path::PathBuf;

use rnb2neus::archive::CameraArchive;
use rnb2neus::camera::{decompose_projection, ViewCamera};
use rnb2neus::images::{self, Raster};
use rnb2neus::lights;
use rnb2neus::manifest::{matrix_to_rows, Frame, TransformManifest};
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "shade")]
struct Opt {
    /// Dataset folder holding cameras.npz, normal/, mask/, and optionally
    /// albedo/.
    #[structopt(name = "FOLDER", parse(from_os_str))]
    folder: PathBuf,

    /// Output folder; defaults to <FOLDER>/shaded.
    #[structopt(long = "out", parse(from_os_str))]
    out: Option<PathBuf>,

    /// Light slant in degrees from the optical axis.
    #[structopt(long = "slant", default_value = "30")]
    slant: f64,
}

fn all_ones_like(image: &Raster) -> Raster {
    let mut out = Raster::new(image.width(), image.height(), 3);
    for y in 0..out.height() {
        for x in 0..out.width() {
            for c in 0..3 {
                out.set(x, y, c, 1.0);
            }
        }
    }
    out
}

fn main() -> Result<(), Error> {
    let opt = Opt::from_args();
    let output = opt.out.unwrap_or_else(|| opt.folder.join("shaded"));
    let images_dir = output.join("images");
    std::fs::create_dir_all(&images_dir)?;

    let normal_paths = images::list_images(&opt.folder.join("normal"))?;
    let mask_paths = images::list_images(&opt.folder.join("mask"))?;
    let albedo_dir = opt.folder.join("albedo");
    let albedo_paths = if albedo_dir.is_dir() {
        Some(images::list_images(&albedo_dir)?)
    } else {
        None
    };

    let archive = CameraArchive::read(&opt.folder.join("cameras.npz"))?;
    if archive.len() != normal_paths.len() || archive.len() != mask_paths.len() {
        return Err(Error::MissingInput(format!(
            "{} cameras, {} normals, {} masks; counts must match",
            archive.len(),
            normal_paths.len(),
            mask_paths.len()
        )));
    }

    let rig = lights::light_directions(opt.slant);
    let mut width = 0u32;
    let mut height = 0u32;
    let mut frames = Vec::with_capacity(archive.len() * rig.len());
    for (i, record) in archive.iter().enumerate() {
        println!("Generating image {}/{}...", i + 1, archive.len());
        let (intrinsics, pose) = decompose_projection(&record.projection())?;
        let camera = ViewCamera::new(&intrinsics, &pose);

        let (normal, depth) = images::load_normal(&normal_paths[i])?;
        let (mask, _) = images::load_image(&mask_paths[i])?;
        let mask = images::binarize_mask(&mask);
        let albedo = match &albedo_paths {
            Some(paths) => images::load_image(&paths[i])?.0,
            None => all_ones_like(&normal),
        };
        width = normal.width() as u32;
        height = normal.height() as u32;

        for (j, light) in rig.iter().enumerate() {
            let shaded = lights::shade(&normal, &albedo.drop_alpha(), *light);
            let name = format!("{:03}_{:03}.png", i, j);
            images::save_image(&images_dir.join(&name), &shaded.with_alpha(&mask), depth)?;

            let world_light = lights::light_to_world(&camera.r_c2w, *light);
            frames.push(Frame {
                file_path: Some(format!("images/{}", name)),
                albedo_path: None,
                normal_path: None,
                transform_matrix: matrix_to_rows(&pose),
                light: Some([world_light.x, world_light.y, world_light.z]),
                intrinsic_matrix: matrix_to_rows(&intrinsics),
            });
        }
    }

    let mut manifest =
        TransformManifest::new(width, height, &archive.records[0].scale_mat());
    manifest.frames = frames;
    manifest.write(&output.join("transform.json"))?;

    println!("Finished.");
    Ok(())
}
