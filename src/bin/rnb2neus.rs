//! Convert a NeuS-style photometric dataset (cameras.npz + normal/mask/albedo
//! folders) into the NeuS2 layout: packed albedo and normal PNGs plus a
//! transform.json manifest.

extern crate rnb2neus;
extern crate structopt;

use structopt::StructOpt;

use std::path::{Path, PathBuf};

use rnb2neus::archive::CameraArchive;
use rnb2neus::camera::decompose_projection;
use rnb2neus::images::{self, Raster};
use rnb2neus::manifest::{matrix_to_rows, Frame, TransformManifest};
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "rnb2neus")]
struct Opt {
    /// Dataset folder holding cameras.npz, normal/, mask/, and optionally
    /// albedo/.
    #[structopt(name = "FOLDER", parse(from_os_str))]
    folder: PathBuf,

    /// Name of the output folder created inside the dataset folder.
    #[structopt(long = "exp-name", default_value = "RNb-NeuS2")]
    exp_name: String,

    /// Folder of mask-certainty images; falls back to mask/ when absent.
    #[structopt(long = "mask-certainty-name", default_value = "mask")]
    mask_certainty_name: String,
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

    let normal_dir = opt.folder.join("normal");
    let mask_dir = opt.folder.join("mask");
    let albedo_dir = opt.folder.join("albedo");
    let certainty_dir = {
        let dir = opt.folder.join(&opt.mask_certainty_name);
        if dir.is_dir() {
            dir
        } else {
            mask_dir.clone()
        }
    };

    let normal_paths = images::list_images(&normal_dir)?;
    let mask_paths = images::list_images(&mask_dir)?;
    let certainty_paths = images::list_images(&certainty_dir)?;
    let albedo_paths = if albedo_dir.is_dir() {
        images::list_images(&albedo_dir)?
    } else {
        normal_paths.clone()
    };

    let archive = CameraArchive::read(&opt.folder.join("cameras.npz"))?;
    if archive.len() != mask_paths.len() {
        return Err(Error::MissingInput(format!(
            "{} cameras but {} masks, the archive and the mask folder must match",
            archive.len(),
            mask_paths.len()
        )));
    }

    let output = opt.folder.join(&opt.exp_name);
    let out_albedo_dir = output.join("albedos");
    let out_normal_dir = output.join("normals");
    std::fs::create_dir_all(&out_albedo_dir)?;
    std::fs::create_dir_all(&out_normal_dir)?;

    let file_name = |p: &Path| p.file_name().unwrap().to_string_lossy().into_owned();

    let mut width = 0u32;
    let mut height = 0u32;
    let mut manifest_frames = Vec::with_capacity(archive.len());
    for (i, record) in archive.iter().enumerate() {
        let (intrinsics, pose) = decompose_projection(&record.projection())?;

        let (normal, depth) = images::load_image(&normal_paths[i])?;
        let (mask, _) = images::load_image(&mask_paths[i])?;
        let (certainty, _) = images::load_image(&certainty_paths[i])?;
        let albedo = if albedo_dir.is_dir() {
            images::load_image(&albedo_paths[i])?.0
        } else {
            all_ones_like(&normal)
        };

        let mask = images::binarize_mask(&mask);
        let certainty = images::binarize_mask(&certainty);

        let albedo_name = file_name(&albedo_paths[i]);
        let normal_name = file_name(&normal_paths[i]);
        images::save_image(
            &out_albedo_dir.join(&albedo_name),
            &albedo.drop_alpha().with_alpha(&certainty),
            depth,
        )?;
        images::save_image(
            &out_normal_dir.join(&normal_name),
            &normal.drop_alpha().with_alpha(&mask),
            depth,
        )?;

        width = normal.width() as u32;
        height = normal.height() as u32;
        manifest_frames.push(Frame {
            file_path: None,
            albedo_path: Some(format!("albedos/{}", albedo_name)),
            normal_path: Some(format!("normals/{}", normal_name)),
            transform_matrix: matrix_to_rows(&pose),
            light: None,
            intrinsic_matrix: matrix_to_rows(&intrinsics),
        });
        println!("Packed view {}/{}", i + 1, archive.len());
    }

    let mut manifest =
        TransformManifest::new(width, height, &archive.records[0].scale_mat());
    manifest.frames = manifest_frames;
    manifest.write(&output.join("transform.json"))?;

    println!("-DONE-");
    Ok(())
}
