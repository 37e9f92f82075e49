//! Dump the decomposed camera parameters of a cameras.npz archive to a
//! cameras.json file: per-view intrinsics, world-to-camera rotation and
//! translation, and Euler angles of the OpenGL-flipped rotation.

extern crate nalgebra as na;
extern crate rnb2neus;
extern crate serde;
extern crate serde_json;
extern crate structopt;

use na::{Matrix3, Vector3, U1, U3};
use serde::Serialize;
use structopt::StructOpt;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use rnb2neus::archive::CameraArchive;
use rnb2neus::camera::decompose_projection;
use rnb2neus::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "cam2json")]
struct Opt {
    /// Folder the cameras.json is written into.
    #[structopt(name = "FOLDER", parse(from_os_str))]
    folder: PathBuf,

    /// Camera archive; defaults to cameras.npz inside the folder.
    #[structopt(long = "camera-file", parse(from_os_str))]
    camera_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct CamerasJson {
    #[serde(rename = "K")]
    k: Vec<[[f64; 3]; 3]>,
    #[serde(rename = "R")]
    r: Vec<[[f64; 3]; 3]>,
    #[serde(rename = "T")]
    t: Vec<[[f64; 1]; 3]>,
    #[serde(rename = "R_euler")]
    r_euler: Vec<[f64; 3]>,
}

fn rows3(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            out[r][c] = m[(r, c)];
        }
    }
    out
}

/// Extrinsic x-y-z Euler angles, degrees, of a rotation matrix
/// `R = Rz(c) Ry(b) Rx(a)`.
fn euler_xyz_degrees(m: &Matrix3<f64>) -> [f64; 3] {
    let b = (-m[(2, 0)]).asin();
    let a = m[(2, 1)].atan2(m[(2, 2)]);
    let c = m[(1, 0)].atan2(m[(0, 0)]);
    [a.to_degrees(), b.to_degrees(), c.to_degrees()]
}

fn main() -> Result<(), Error> {
    let opt = Opt::from_args();
    let camera_file = match opt.camera_file {
        Some(ref f) => f.clone(),
        None => opt.folder.join("cameras.npz"),
    };

    let archive = CameraArchive::read(&camera_file)?;
    let mut out = CamerasJson {
        k: Vec::with_capacity(archive.len()),
        r: Vec::with_capacity(archive.len()),
        t: Vec::with_capacity(archive.len()),
        r_euler: Vec::with_capacity(archive.len()),
    };

    let flip = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0);
    for record in archive.iter() {
        let (intrinsics, pose) = decompose_projection(&record.world_projection())?;
        let k: Matrix3<f64> = intrinsics.fixed_slice::<U3, U3>(0, 0).into_owned();
        let r_c2w: Matrix3<f64> = pose.fixed_slice::<U3, U3>(0, 0).into_owned();
        let center: Vector3<f64> = pose.fixed_slice::<U3, U1>(0, 3).into_owned();

        let r_w2c = r_c2w.transpose();
        let t = -(r_w2c * center);
        let euler = euler_xyz_degrees(&(flip * r_w2c).transpose());

        out.k.push(rows3(&k));
        out.r.push(rows3(&r_w2c));
        out.t.push([[t[0]], [t[1]], [t[2]]]);
        out.r_euler.push(euler);
    }

    let path = opt.folder.join("cameras.json");
    let file = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(file, &out).map_err(Error::from)?;
    println!("Wrote {} cameras to {}", archive.len(), path.display());
    Ok(())
}
