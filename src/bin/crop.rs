//! Crop an IDR-style dataset to the union bounding box of its masks.
//!
//! Every view's principal point is shifted by the crop offset and the
//! projection matrices are rebuilt, so the cropped images stay consistent
//! with the rewritten cameras.npz. Views sharing camera hardware or pose
//! are collapsed into deduplicated intrinsic/pose tables first, the way
//! SfM tooling expects them.

extern crate nalgebra as na;
extern crate rnb2neus;
extern crate structopt;

use na::{Matrix4, U1, U3};
use structopt::StructOpt;

use std::path::PathBuf;

use rnb2neus::archive::{CameraArchive, CameraRecord};
use rnb2neus::camera::{cv_to_gl, decompose_projection, gl_to_cv};
use rnb2neus::dedup::{IntrinsicKind, IntrinsicRecord, IntrinsicTable, PoseRecord, PoseTable};
use rnb2neus::images::{self, BitDepth};
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "crop")]
struct Opt {
    /// Dataset folder holding cameras.npz, normal/, and mask/.
    #[structopt(name = "FOLDER", parse(from_os_str))]
    folder: PathBuf,

    /// Output folder for the cropped dataset.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,

    /// Compose the scale matrices into the projections before decomposing.
    #[structopt(long = "use-scale")]
    use_scale: bool,
}

fn main() -> Result<(), Error> {
    let opt = Opt::from_args();

    let image_dir = opt.folder.join("normal");
    let mask_dir = opt.folder.join("mask");
    let archive = CameraArchive::read(&opt.folder.join("cameras.npz"))?;
    let image_paths = images::list_images(&image_dir)?;
    let mask_paths = images::list_images(&mask_dir)?;
    if image_paths.len() != archive.len() || mask_paths.len() != archive.len() {
        return Err(Error::MissingInput(format!(
            "{} cameras, {} images, {} masks; counts must match",
            archive.len(),
            image_paths.len(),
            mask_paths.len()
        )));
    }

    // Decompose every view and collapse repeated intrinsics/poses
    let mut intrinsics_table = IntrinsicTable::new();
    let mut pose_table = PoseTable::new();
    let mut view_ids = Vec::with_capacity(archive.len());
    let mut rasters = Vec::with_capacity(archive.len());
    let mut masks = Vec::with_capacity(archive.len());
    for (i, record) in archive.iter().enumerate() {
        let p = if opt.use_scale {
            record.projection()
        } else {
            record.world_projection()
        };
        let (k, pose) = decompose_projection(&p)?;
        let pose_gl = cv_to_gl(&pose);

        let (image, _) = images::load_image(&image_paths[i])?;
        let (mask, _) = images::load_image(&mask_paths[i])?;
        let (width, height) = (image.width(), image.height());
        println!(
            "Image {}/{}: {} ({}x{})",
            i + 1,
            archive.len(),
            image_paths[i].display(),
            width,
            height
        );

        let intrinsic_id = intrinsics_table.insert(IntrinsicRecord {
            width: width as u32,
            height: height as u32,
            kind: IntrinsicKind::PixelFocal {
                fx: k[(0, 0)],
                fy: k[(1, 1)],
            },
            principal: (
                k[(0, 2)] - width as f64 / 2.0,
                k[(1, 2)] - height as f64 / 2.0,
            ),
        });
        let pose_id = pose_table.insert(PoseRecord {
            rotation: pose_gl.fixed_slice::<U3, U3>(0, 0).into_owned(),
            center: pose_gl.fixed_slice::<U3, U1>(0, 3).into_owned(),
        });
        view_ids.push((intrinsic_id, pose_id));
        rasters.push(image);
        masks.push(mask);
    }
    println!(
        "{} unique intrinsics and {} unique poses across {} views",
        intrinsics_table.len(),
        pose_table.len(),
        archive.len()
    );

    // Union bounding box of the mask foregrounds
    let mut bbox = (usize::max_value(), usize::max_value(), 0usize, 0usize);
    for mask in &masks {
        for (x, y) in mask.nonzero_pixels() {
            bbox.0 = bbox.0.min(x);
            bbox.1 = bbox.1.min(y);
            bbox.2 = bbox.2.max(x);
            bbox.3 = bbox.3.max(y);
        }
    }
    if bbox.0 == usize::max_value() {
        return Err(Error::MissingInput(
            "every mask is empty, nothing to crop to".to_string(),
        ));
    }
    let (x0, y0, x1, y1) = bbox;
    println!("Crop box: x {}..{}, y {}..{}", x0, x1, y0, y1);

    let out_image_dir = opt.output.join("image");
    let out_mask_dir = opt.output.join("mask");
    std::fs::create_dir_all(&out_image_dir)?;
    std::fs::create_dir_all(&out_mask_dir)?;

    let mut records = Vec::with_capacity(archive.len());
    for (i, (intrinsic_id, pose_id)) in view_ids.iter().enumerate() {
        let intrinsic = intrinsics_table.get(*intrinsic_id);
        let (fx, fy) = match intrinsic.kind {
            IntrinsicKind::PixelFocal { fx, fy } => (fx, fy),
            _ => unreachable!(),
        };
        let cx = intrinsic.width as f64 / 2.0 + intrinsic.principal.0 - x0 as f64;
        let cy = intrinsic.height as f64 / 2.0 + intrinsic.principal.1 - y0 as f64;
        let mut k = Matrix4::identity();
        k[(0, 0)] = fx;
        k[(1, 1)] = fy;
        k[(0, 2)] = cx;
        k[(1, 2)] = cy;

        let pose = pose_table.get(*pose_id);
        let mut c2w_gl = Matrix4::identity();
        c2w_gl
            .fixed_slice_mut::<U3, U3>(0, 0)
            .copy_from(&pose.rotation);
        c2w_gl
            .fixed_slice_mut::<U3, U1>(0, 3)
            .copy_from(&pose.center);
        let c2w_cv = gl_to_cv(&c2w_gl);
        let w2c = c2w_cv.try_inverse().ok_or_else(|| {
            Error::DegenerateCamera(format!("pose of view {} is not invertible", i))
        })?;
        records.push(CameraRecord::Minimal {
            world_mat: k * w2c,
            scale_mat: None,
        });

        let image = rasters[i].crop(x0, y0, x1, y1);
        let mask = masks[i].crop(x0, y0, x1, y1);
        let name = format!("{:08}.png", i);
        let image = if image.channels() >= 3 {
            image.drop_alpha()
        } else {
            image
        };
        images::save_image(&out_image_dir.join(&name), &image, BitDepth::Eight)?;
        images::save_image(&out_mask_dir.join(&name), &mask, BitDepth::Eight)?;
    }

    CameraArchive::new(records).write(&opt.output.join("cameras.npz"))?;
    println!("-DONE-");
    Ok(())
}
