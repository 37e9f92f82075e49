//! NeuS2 `transform.json` manifests.

extern crate nalgebra as na;
extern crate serde;
extern crate serde_json;

use na::Matrix4;
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::Error;

/// One view in the manifest. Shaded renders use `file_path`; decomposed
/// photometric inputs use `albedo_path` and `normal_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub albedo_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal_path: Option<String>,
    /// Camera-to-world pose, OpenCV convention.
    pub transform_matrix: [[f64; 4]; 4],
    /// World-space light direction, when the frame was shaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<[f64; 3]>,
    pub intrinsic_matrix: [[f64; 4]; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformManifest {
    pub w: u32,
    pub h: u32,
    pub aabb_scale: f64,
    pub scale: f64,
    /// NeuS scenes live in [-1,1], instant-ngp in [0,1].
    pub offset: [f64; 3],
    pub from_na: bool,
    /// Normalization-to-world matrix, the first view's scale matrix.
    pub n2w: [[f64; 4]; 4],
    pub frames: Vec<Frame>,
}

impl TransformManifest {
    pub fn new(w: u32, h: u32, n2w: &Matrix4<f64>) -> Self {
        TransformManifest {
            w,
            h,
            aabb_scale: 1.0,
            scale: 0.5,
            offset: [0.5, 0.5, 0.5],
            from_na: true,
            n2w: matrix_to_rows(n2w),
            frames: Vec::new(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::MissingInput(format!(
                "manifest {}",
                path.display()
            )));
        }
        let file = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }
}

pub fn matrix_to_rows(m: &Matrix4<f64>) -> [[f64; 4]; 4] {
    let mut rows = [[0.0; 4]; 4];
    for r in 0..4 {
        for c in 0..4 {
            rows[r][c] = m[(r, c)];
        }
    }
    rows
}

pub fn rows_to_matrix(rows: &[[f64; 4]; 4]) -> Matrix4<f64> {
    Matrix4::from_fn(|r, c| rows[r][c])
}

#[test]
fn test_manifest_serialization() {
    let mut manifest = TransformManifest::new(640, 480, &Matrix4::identity());
    manifest.frames.push(Frame {
        file_path: None,
        albedo_path: Some("albedos/000.png".to_string()),
        normal_path: Some("normals/000.png".to_string()),
        transform_matrix: matrix_to_rows(&Matrix4::identity()),
        light: None,
        intrinsic_matrix: matrix_to_rows(&Matrix4::identity()),
    });

    let json = serde_json::to_string_pretty(&manifest).unwrap();
    assert!(json.contains("\"from_na\": true"));
    assert!(json.contains("\"aabb_scale\": 1.0"));
    assert!(json.contains("\"n2w\""));
    assert!(json.contains("\"albedo_path\": \"albedos/000.png\""));
    // unused path and light entries are omitted entirely
    assert!(!json.contains("file_path"));
    assert!(!json.contains("light"));
}

#[test]
fn test_manifest_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transform.json");

    let mut manifest = TransformManifest::new(32, 16, &(Matrix4::identity() * 2.0));
    manifest.frames.push(Frame {
        file_path: Some("images/000_000.png".to_string()),
        albedo_path: None,
        normal_path: None,
        transform_matrix: matrix_to_rows(&Matrix4::identity()),
        light: Some([0.0, 0.5, -0.5]),
        intrinsic_matrix: matrix_to_rows(&Matrix4::identity()),
    });
    manifest.write(&path).unwrap();

    let back = TransformManifest::read(&path).unwrap();
    assert_eq!(back.w, 32);
    assert_eq!(back.h, 16);
    assert_eq!(back.n2w[0][0], 2.0);
    assert_eq!(back.frames.len(), 1);
    assert_eq!(back.frames[0].light, Some([0.0, 0.5, -0.5]));
    assert_eq!(back.frames[0].albedo_path, None);
}

#[test]
fn test_matrix_rows_round_trip() {
    let m = Matrix4::from_fn(|r, c| (r * 4 + c) as f64);
    assert_eq!(rows_to_matrix(&matrix_to_rows(&m)), m);
}
