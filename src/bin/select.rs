//! Extract a subset of views from an IDR-style dataset, renumbering images
//! and camera archive entries. Legacy archive entries (camera_mat, inverse
//! matrices) are carried over untouched.

extern crate rnb2neus;
extern crate structopt;

use structopt::StructOpt;

use std::path::{Path, PathBuf};

use rnb2neus::archive::CameraArchive;
use rnb2neus::images;
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "select")]
struct Opt {
    /// Source dataset folder.
    #[structopt(long = "data-path", parse(from_os_str))]
    data_path: PathBuf,

    /// Output folder.
    #[structopt(long = "output-path", parse(from_os_str))]
    output_path: PathBuf,

    /// Indices of the views to keep, in output order.
    #[structopt(long = "ind-images")]
    ind_images: Vec<usize>,
}

/// Copy the selected files of one image folder, renumbered from zero.
fn select_folder(src: &Path, dst: &Path, indices: &[usize]) -> Result<(), Error> {
    let files = images::list_images(src)?;
    std::fs::create_dir_all(dst)?;
    for (ii, ind) in indices.iter().enumerate() {
        let source = files.get(*ind).ok_or_else(|| {
            Error::MissingInput(format!(
                "view {} requested but {} holds {} images",
                ind,
                src.display(),
                files.len()
            ))
        })?;
        std::fs::copy(source, dst.join(format!("{:03}.png", ii)))?;
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    let opt = Opt::from_args();

    let albedo_dir = opt.data_path.join("albedo");
    if albedo_dir.is_dir() {
        select_folder(
            &albedo_dir,
            &opt.output_path.join("albedo"),
            &opt.ind_images,
        )?;
    }
    select_folder(
        &opt.data_path.join("normal"),
        &opt.output_path.join("normal"),
        &opt.ind_images,
    )?;
    select_folder(
        &opt.data_path.join("mask"),
        &opt.output_path.join("mask"),
        &opt.ind_images,
    )?;

    let archive = CameraArchive::read(&opt.data_path.join("cameras.npz"))?;
    let records = opt
        .ind_images
        .iter()
        .map(|ind| {
            archive.records.get(*ind).cloned().ok_or_else(|| {
                Error::MissingInput(format!(
                    "view {} requested but the archive holds {} cameras",
                    ind,
                    archive.len()
                ))
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    CameraArchive::new(records).write(&opt.output_path.join("cameras.npz"))?;

    println!(
        "Selected {} of {} views into {}",
        opt.ind_images.len(),
        archive.len(),
        opt.output_path.display()
    );
    Ok(())
}
