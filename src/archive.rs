//! IDR-style camera archives (`cameras.npz`).
//!
//! An archive is a zip container of little-endian numpy arrays, one entry
//! per key: `world_mat_{i}` (required, 3x4 or 4x4 projection), `scale_mat_{i}`
//! (optional unit-sphere normalization), and the legacy passthrough variants
//! `camera_mat_{i}`, `camera_mat_inv_{i}`, `world_mat_inv_{i}`,
//! `scale_mat_inv_{i}`. The number of views is implied by the largest
//! contiguous `world_mat` index.

extern crate byteorder;
extern crate itertools;
extern crate nalgebra as na;
extern crate nom;
extern crate zip;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;
use na::{Matrix3x4, Matrix4, U3, U4};
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt};
use nom::multi::separated_list;
use nom::number::complete::{le_u16, le_u8};
use nom::sequence::{delimited, terminated};
use nom::IResult;

use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter, Cursor};
use std::path::Path;
use std::str::FromStr;

use crate::Error;

/// A dense array read from a `.npy` entry, always in C order.
#[derive(Debug, Clone)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

fn unsigned(input: &str) -> IResult<&str, usize> {
    map_res(digit1, usize::from_str)(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('\''), is_not("'"), char('\''))(input)
}

fn py_bool(input: &str) -> IResult<&str, bool> {
    alt((map(tag("True"), |_| true), map(tag("False"), |_| false)))(input)
}

fn shape_tuple(input: &str) -> IResult<&str, Vec<usize>> {
    delimited(
        char('('),
        terminated(separated_list(tag(", "), unsigned), opt(char(','))),
        char(')'),
    )(input)
}

// numpy writes the header dict keys in this fixed order
fn header_dict(input: &str) -> IResult<&str, (&str, bool, Vec<usize>)> {
    let (input, _) = tag("{'descr': ")(input)?;
    let (input, descr) = quoted(input)?;
    let (input, _) = tag(", 'fortran_order': ")(input)?;
    let (input, fortran) = py_bool(input)?;
    let (input, _) = tag(", 'shape': ")(input)?;
    let (input, shape) = shape_tuple(input)?;
    Ok((input, (descr, fortran, shape)))
}

/// Parse a version 1 `.npy` buffer holding a `<f4` or `<f8` array.
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray, Error> {
    fn preamble(input: &[u8]) -> IResult<&[u8], (u8, u8, u16)> {
        let (input, _) = tag(&b"\x93NUMPY"[..])(input)?;
        let (input, major) = le_u8(input)?;
        let (input, minor) = le_u8(input)?;
        let (input, header_len) = le_u16(input)?;
        Ok((input, (major, minor, header_len)))
    }

    let (rest, (major, _minor, header_len)) =
        preamble(bytes).map_err(|_| Error::ParseError("not a npy file".to_string()))?;
    if major != 1 {
        return Err(Error::ParseError(format!(
            "unsupported npy version {}",
            major
        )));
    }
    if rest.len() < header_len as usize {
        return Err(Error::ParseError("truncated npy header".to_string()));
    }
    let (header, payload) = rest.split_at(header_len as usize);
    let header = std::str::from_utf8(header)
        .map_err(|_| Error::ParseError("npy header is not ascii".to_string()))?;
    let (_, (descr, fortran, shape)) =
        header_dict(header).map_err(|_| Error::ParseError(format!("bad npy header {}", header)))?;

    let count: usize = shape.iter().product();
    let mut cursor = Cursor::new(payload);
    let mut data = vec![0.0f64; count];
    match descr {
        "<f8" => cursor.read_f64_into::<LittleEndian>(&mut data)?,
        "<f4" => {
            let mut single = vec![0.0f32; count];
            cursor.read_f32_into::<LittleEndian>(&mut single)?;
            for (d, s) in data.iter_mut().zip(single) {
                *d = s as f64;
            }
        }
        other => {
            return Err(Error::ParseError(format!("unsupported dtype {}", other)));
        }
    }

    // normalize to C order
    if fortran && shape.len() == 2 {
        let (rows, cols) = (shape[0], shape[1]);
        let mut c_order = vec![0.0f64; count];
        for r in 0..rows {
            for c in 0..cols {
                c_order[r * cols + c] = data[c * rows + r];
            }
        }
        data = c_order;
    }

    Ok(NpyArray { shape, data })
}

/// Write an array as a version 1 `<f8` C-order `.npy` buffer.
pub fn write_npy<W: Write>(w: &mut W, shape: &[usize], data: &[f64]) -> Result<(), Error> {
    assert_eq!(shape.iter().product::<usize>(), data.len());
    let shape_str = match shape.len() {
        1 => format!("({},)", shape[0]),
        _ => format!("({})", shape.iter().join(", ")),
    };
    let mut dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape_str
    );
    // pad the full preamble to a 64 byte boundary, newline terminated
    let unpadded = 10 + dict.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    for _ in 0..pad {
        dict.push(' ');
    }
    dict.push('\n');

    w.write_all(b"\x93NUMPY")?;
    w.write_all(&[1, 0])?;
    w.write_u16::<LittleEndian>(dict.len() as u16)?;
    w.write_all(dict.as_bytes())?;
    for v in data {
        w.write_f64::<LittleEndian>(*v)?;
    }
    Ok(())
}

/// Write a single array to a standalone `.npy` file.
pub fn write_npy_file(path: &Path, shape: &[usize], data: &[f64]) -> Result<(), Error> {
    let mut file = BufWriter::new(File::create(path)?);
    write_npy(&mut file, shape, data)
}

/// Read a single standalone `.npy` file.
pub fn read_npy_file(path: &Path) -> Result<NpyArray, Error> {
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    parse_npy(&contents)
}

fn to_matrix4(key: &str, array: &NpyArray) -> Result<Matrix4<f64>, Error> {
    match array.shape.as_slice() {
        [4, 4] => Ok(Matrix4::from_row_slice(&array.data)),
        [3, 4] => {
            let mut m = Matrix4::identity();
            m.fixed_slice_mut::<U3, U4>(0, 0)
                .copy_from(&Matrix3x4::from_row_slice(&array.data));
            Ok(m)
        }
        shape => Err(Error::ParseError(format!(
            "{} has shape {:?}, expected 3x4 or 4x4",
            key, shape
        ))),
    }
}

fn matrix_rows(m: &Matrix4<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(16);
    for r in 0..4 {
        for c in 0..4 {
            out.push(m[(r, c)]);
        }
    }
    out
}

/// Per-view camera entry. `Minimal` is the common IDR layout; `Extended`
/// additionally carries the legacy precomputed matrices, which are passed
/// through unchanged on rewrite.
#[derive(Debug, Clone)]
pub enum CameraRecord {
    Minimal {
        world_mat: Matrix4<f64>,
        scale_mat: Option<Matrix4<f64>>,
    },
    Extended {
        world_mat: Matrix4<f64>,
        scale_mat: Option<Matrix4<f64>>,
        camera_mat: Option<Matrix4<f64>>,
        camera_mat_inv: Option<Matrix4<f64>>,
        world_mat_inv: Option<Matrix4<f64>>,
        scale_mat_inv: Option<Matrix4<f64>>,
    },
}

impl CameraRecord {
    pub fn world_mat(&self) -> &Matrix4<f64> {
        match self {
            CameraRecord::Minimal { world_mat, .. } => world_mat,
            CameraRecord::Extended { world_mat, .. } => world_mat,
        }
    }

    /// The normalization matrix, identity when the archive carries none.
    pub fn scale_mat(&self) -> Matrix4<f64> {
        let scale = match self {
            CameraRecord::Minimal { scale_mat, .. } => scale_mat,
            CameraRecord::Extended { scale_mat, .. } => scale_mat,
        };
        (*scale).unwrap_or_else(Matrix4::identity)
    }

    /// Replace the normalization matrix, keeping any passthrough entries.
    pub fn set_scale_mat(&mut self, m: Matrix4<f64>) {
        match self {
            CameraRecord::Minimal { scale_mat, .. } => *scale_mat = Some(m),
            CameraRecord::Extended { scale_mat, .. } => *scale_mat = Some(m),
        }
    }

    /// The 3x4 world-to-image projection `world_mat * scale_mat`.
    pub fn projection(&self) -> Matrix3x4<f64> {
        let p = self.world_mat() * self.scale_mat();
        p.fixed_slice::<U3, U4>(0, 0).into_owned()
    }

    /// The 3x4 projection of the raw world matrix, ignoring any scale
    /// matrix.
    pub fn world_projection(&self) -> Matrix3x4<f64> {
        self.world_mat().fixed_slice::<U3, U4>(0, 0).into_owned()
    }
}

/// An ordered set of per-view camera records backed by a `cameras.npz` file.
#[derive(Debug, Clone)]
pub struct CameraArchive {
    pub records: Vec<CameraRecord>,
}

impl CameraArchive {
    pub fn new(records: Vec<CameraRecord>) -> Self {
        CameraArchive { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<CameraRecord> {
        self.records.iter()
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::MissingInput(format!(
                "camera archive {}",
                path.display()
            )));
        }
        let file = BufReader::new(File::open(path)?);
        let mut container = zip::ZipArchive::new(file)?;

        let mut arrays = HashMap::new();
        for i in 0..container.len() {
            let mut entry = container.by_index(i)?;
            let key = entry.name().trim_end_matches(".npy").to_string();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            let array = parse_npy(&contents)?;
            arrays.insert(key, array);
        }

        // prefixes ordered so the _inv variants match first
        const PREFIXES: [&str; 6] = [
            "world_mat_inv_",
            "scale_mat_inv_",
            "camera_mat_inv_",
            "camera_mat_",
            "world_mat_",
            "scale_mat_",
        ];
        let mut by_kind: HashMap<&str, HashMap<usize, Matrix4<f64>>> = HashMap::new();
        for (key, array) in arrays.iter() {
            for &prefix in PREFIXES.iter() {
                if let Some(index) = key.strip_prefix(prefix) {
                    if let Ok(index) = usize::from_str(index) {
                        let m = to_matrix4(key, array)?;
                        by_kind.entry(prefix).or_default().insert(index, m);
                        break;
                    }
                }
            }
        }

        let world = by_kind.remove("world_mat_").unwrap_or_default();
        let mut n = 0;
        while world.contains_key(&n) {
            n += 1;
        }
        if n == 0 {
            return Err(Error::MissingInput(format!(
                "{} holds no world_mat_0 entry",
                path.display()
            )));
        }

        let take = |kind: &str, i: usize| -> Option<Matrix4<f64>> {
            by_kind.get(kind).and_then(|m| m.get(&i)).cloned()
        };
        let records = (0..n)
            .map(|i| {
                let world_mat = world[&i];
                let scale_mat = take("scale_mat_", i);
                let camera_mat = take("camera_mat_", i);
                let camera_mat_inv = take("camera_mat_inv_", i);
                let world_mat_inv = take("world_mat_inv_", i);
                let scale_mat_inv = take("scale_mat_inv_", i);
                if camera_mat.is_some()
                    || camera_mat_inv.is_some()
                    || world_mat_inv.is_some()
                    || scale_mat_inv.is_some()
                {
                    CameraRecord::Extended {
                        world_mat,
                        scale_mat,
                        camera_mat,
                        camera_mat_inv,
                        world_mat_inv,
                        scale_mat_inv,
                    }
                } else {
                    CameraRecord::Minimal {
                        world_mat,
                        scale_mat,
                    }
                }
            })
            .collect();

        Ok(CameraArchive { records })
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let file = BufWriter::new(File::create(path)?);
        let mut container = zip::ZipWriter::new(file);
        // numpy savez stores entries uncompressed
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);

        let put = |container: &mut zip::ZipWriter<BufWriter<File>>,
                       key: String,
                       m: &Matrix4<f64>|
         -> Result<(), Error> {
            container.start_file(format!("{}.npy", key), options)?;
            let mut buf = Vec::new();
            write_npy(&mut buf, &[4, 4], &matrix_rows(m))?;
            container.write_all(&buf)?;
            Ok(())
        };

        for (i, record) in self.records.iter().enumerate() {
            put(&mut container, format!("world_mat_{}", i), record.world_mat())?;
            match record {
                CameraRecord::Minimal { scale_mat, .. } => {
                    if let Some(scale) = scale_mat {
                        put(&mut container, format!("scale_mat_{}", i), scale)?;
                    }
                }
                CameraRecord::Extended {
                    scale_mat,
                    camera_mat,
                    camera_mat_inv,
                    world_mat_inv,
                    scale_mat_inv,
                    ..
                } => {
                    if let Some(m) = scale_mat {
                        put(&mut container, format!("scale_mat_{}", i), m)?;
                    }
                    if let Some(m) = camera_mat {
                        put(&mut container, format!("camera_mat_{}", i), m)?;
                    }
                    if let Some(m) = camera_mat_inv {
                        put(&mut container, format!("camera_mat_inv_{}", i), m)?;
                    }
                    if let Some(m) = world_mat_inv {
                        put(&mut container, format!("world_mat_inv_{}", i), m)?;
                    }
                    if let Some(m) = scale_mat_inv {
                        put(&mut container, format!("scale_mat_inv_{}", i), m)?;
                    }
                }
            }
        }
        container.finish()?;
        Ok(())
    }
}

#[test]
fn test_npy_round_trip() {
    let shape = [3, 4];
    let data: Vec<f64> = (0..12).map(|x| x as f64 * 0.5).collect();
    let mut buf = Vec::new();
    write_npy(&mut buf, &shape, &data).unwrap();
    let array = parse_npy(&buf).unwrap();
    assert_eq!(array.shape, vec![3, 4]);
    assert_eq!(array.data, data);
}

#[test]
fn test_npy_one_dimensional() {
    let data = vec![1.0, 2.0, 3.0];
    let mut buf = Vec::new();
    write_npy(&mut buf, &[3], &data).unwrap();
    let array = parse_npy(&buf).unwrap();
    assert_eq!(array.shape, vec![3]);
    assert_eq!(array.data, data);
}

#[test]
fn test_npy_fortran_order() {
    // hand-built fortran order 2x3 array holding 1..6 row-major
    let dict = {
        let mut d =
            "{'descr': '<f8', 'fortran_order': True, 'shape': (2, 3), }".to_string();
        let pad = (64 - (10 + d.len() + 1) % 64) % 64;
        for _ in 0..pad {
            d.push(' ');
        }
        d.push('\n');
        d
    };
    let mut buf = Vec::new();
    buf.extend_from_slice(b"\x93NUMPY");
    buf.extend_from_slice(&[1, 0]);
    buf.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    buf.extend_from_slice(dict.as_bytes());
    for v in &[1.0f64, 4.0, 2.0, 5.0, 3.0, 6.0] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    let array = parse_npy(&buf).unwrap();
    assert_eq!(array.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_archive_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cameras.npz");

    let world = Matrix4::new(
        800.0, 0.0, 320.0, 10.0, //
        0.0, 800.0, 240.0, -5.0, //
        0.0, 0.0, 1.0, 2.0, //
        0.0, 0.0, 0.0, 1.0,
    );
    let scale = Matrix4::identity() * 2.0;
    let archive = CameraArchive::new(vec![
        CameraRecord::Minimal {
            world_mat: world,
            scale_mat: Some(scale),
        },
        CameraRecord::Minimal {
            world_mat: world * 1.5,
            scale_mat: None,
        },
    ]);
    archive.write(&path).unwrap();

    let back = CameraArchive::read(&path).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back.records[0].world_mat(), &world);
    assert_eq!(back.records[0].scale_mat(), scale);
    assert_eq!(back.records[1].scale_mat(), Matrix4::identity());
}

#[test]
fn test_archive_extended_passthrough() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cameras.npz");

    let world = Matrix4::identity() * 3.0;
    let camera = Matrix4::identity() * 7.0;
    let archive = CameraArchive::new(vec![CameraRecord::Extended {
        world_mat: world,
        scale_mat: None,
        camera_mat: Some(camera),
        camera_mat_inv: None,
        world_mat_inv: Some(Matrix4::identity()),
        scale_mat_inv: None,
    }]);
    archive.write(&path).unwrap();

    match &CameraArchive::read(&path).unwrap().records[0] {
        CameraRecord::Extended {
            camera_mat,
            world_mat_inv,
            ..
        } => {
            assert_eq!(camera_mat.as_ref(), Some(&camera));
            assert_eq!(world_mat_inv.as_ref(), Some(&Matrix4::identity()));
        }
        other => panic!("expected extended record, got {:?}", other),
    }
}

#[test]
fn test_archive_missing_world_mat() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.npz");
    let file = File::create(&path).unwrap();
    let mut container = zip::ZipWriter::new(file);
    container
        .start_file(
            "scale_mat_0.npy",
            zip::write::FileOptions::default(),
        )
        .unwrap();
    let mut buf = Vec::new();
    write_npy(&mut buf, &[4, 4], &matrix_rows(&Matrix4::identity())).unwrap();
    container.write_all(&buf).unwrap();
    container.finish().unwrap();

    match CameraArchive::read(&path) {
        Err(Error::MissingInput(_)) => (),
        other => panic!("expected MissingInput, got {:?}", other),
    }
}
