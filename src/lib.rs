//! Data preparation for multi-view photometric 3D reconstruction.
//!
//! This crate converts between the on-disk camera/dataset conventions used by
//! IDR-style pipelines (`cameras.npz` projection matrices), NeuS/NeuS2
//! trainers (`transform.json` manifests), and DiLiGenT-MV-like folder
//! layouts, and estimates per-view albedo scale corrections so that the same
//! surface point has a consistent albedo across neighboring viewpoints.
//!
//! Example usage:
//! ```no_run
//! use rnb2neus::*;
//! use std::path::Path;
//!
//! // load the camera archive and decompose every view
//! let archive = CameraArchive::read(Path::new("cameras.npz")).unwrap();
//! for record in archive.iter() {
//!     let p = record.projection();
//!     let (k, pose) = decompose_projection(&p).unwrap();
//!     let camera = ViewCamera::new(&k, &pose);
//!     println!("camera center: {}", camera.center);
//! }
//! ```

extern crate byteorder;
extern crate cgmath;
extern crate embree_rs;
extern crate image;
extern crate indicatif;
extern crate itertools;
extern crate nalgebra;
extern crate nom;
extern crate rand;
extern crate rayon;
extern crate serde;
extern crate serde_json;
extern crate tobj;
extern crate zip;

pub mod albedo;
pub mod archive;
pub mod camera;
pub mod dedup;
pub mod images;
pub mod lights;
pub mod manifest;
pub mod mesh;

pub use crate::albedo::{estimate_scale_ratios, propagate, ScaleConfig};
pub use crate::archive::{CameraArchive, CameraRecord};
pub use crate::camera::{cv_to_gl, decompose_projection, gl_to_cv, ViewCamera};
pub use crate::dedup::{IntrinsicKind, IntrinsicRecord, IntrinsicTable, PoseRecord, PoseTable};
pub use crate::images::{BitDepth, Raster};
pub use crate::manifest::{Frame, TransformManifest};

#[derive(Debug)]
pub enum Error {
    /// A projection matrix whose leading 3x3 block is singular; the view
    /// cannot be decomposed and must be excluded.
    DegenerateCamera(String),
    /// An expected input folder or file is absent.
    MissingInput(String),
    /// A view yielded no usable cross-view correspondence samples.
    InsufficientSamples(usize),
    ParseError(String),
    IOError(std::io::Error),
    ImageError(image::ImageError),
    ZipError(zip::result::ZipError),
    JsonError(serde_json::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::ImageError(e)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::ZipError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DegenerateCamera(what) => write!(f, "degenerate camera: {}", what),
            Error::MissingInput(what) => write!(f, "missing input: {}", what),
            Error::InsufficientSamples(view) => {
                write!(f, "view {} has no usable cross-view samples", view)
            }
            Error::ParseError(what) => write!(f, "parse error: {}", what),
            Error::IOError(e) => write!(f, "{}", e),
            Error::ImageError(e) => write!(f, "{}", e),
            Error::ZipError(e) => write!(f, "{}", e),
            Error::JsonError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}
