//! Copy the first scale matrix of a donor archive into every view of a
//! target archive, rewriting the target in place.

extern crate rnb2neus;
extern crate structopt;

use structopt::StructOpt;

use std::path::PathBuf;

use rnb2neus::archive::CameraArchive;
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "copyscale")]
struct Opt {
    /// Archive to rewrite.
    #[structopt(long = "cameras-npz", default_value = "cameras.npz", parse(from_os_str))]
    cameras_npz: PathBuf,

    /// Archive donating its scale_mat_0.
    #[structopt(long = "copy-npz", default_value = "copy.npz", parse(from_os_str))]
    copy_npz: PathBuf,
}

fn main() -> Result<(), Error> {
    let opt = Opt::from_args();

    let mut cameras = CameraArchive::read(&opt.cameras_npz)?;
    let donor = CameraArchive::read(&opt.copy_npz)?;
    let scale = donor.records[0].scale_mat();

    for record in cameras.records.iter_mut() {
        record.set_scale_mat(scale);
    }
    cameras.write(&opt.cameras_npz)?;
    println!(
        "Copied scale matrix into {} views of {}",
        cameras.len(),
        opt.cameras_npz.display()
    );
    Ok(())
}
