//! Image I/O and raster sampling.
//!
//! All pixel data is held as `f32` in [0, 1] (row major, interleaved
//! channels) regardless of the on-disk depth; the source bit depth is
//! reported alongside so outputs can round-trip at the depth they came in
//! with. PNG output disables filtering and uses fast compression, which is
//! lossless either way — normal and albedo maps must survive a write/read
//! cycle bit exactly.

extern crate image;

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, DynamicImage, ImageEncoder};

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::Error;

/// Masks are stored as 0/255 or 0/65535; anything above this fraction of
/// full scale counts as foreground.
pub const MASK_THRESHOLD: f32 = 0.49;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    fn max_value(self) -> f32 {
        match self {
            BitDepth::Eight => 255.0,
            BitDepth::Sixteen => 65535.0,
        }
    }
}

/// A dense float image with 1, 3, or 4 interleaved channels.
#[derive(Debug, Clone)]
pub struct Raster {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Raster {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Raster {
            width,
            height,
            channels,
            data: vec![0.0; width * height * channels],
        }
    }

    pub fn from_data(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height * channels);
        Raster {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn get(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    pub fn set(&mut self, x: usize, y: usize, c: usize, v: f32) {
        self.data[(y * self.width + x) * self.channels + c] = v;
    }

    /// Bilinear sample of one channel at a fractional pixel position.
    /// `x` and `y` must lie inside `[0, width-1] x [0, height-1]`.
    pub fn bilinear(&self, x: f64, y: f64, c: usize) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let tx = (x - x0) as f32;
        let ty = (y - y0) as f32;
        let xi = x0 as usize;
        let yi = y0 as usize;
        let xj = (xi + 1).min(self.width - 1);
        let yj = (yi + 1).min(self.height - 1);

        let v00 = self.get(xi, yi, c);
        let v10 = self.get(xj, yi, c);
        let v01 = self.get(xi, yj, c);
        let v11 = self.get(xj, yj, c);
        v00 * (1.0 - tx) * (1.0 - ty)
            + v10 * tx * (1.0 - ty)
            + v01 * (1.0 - tx) * ty
            + v11 * tx * ty
    }

    /// The first three channels as a new raster.
    pub fn drop_alpha(&self) -> Raster {
        assert!(self.channels >= 3);
        let mut out = Raster::new(self.width, self.height, 3);
        for y in 0..self.height {
            for x in 0..self.width {
                for c in 0..3 {
                    out.set(x, y, c, self.get(x, y, c));
                }
            }
        }
        out
    }

    /// The fourth channel as a single-channel raster, if present.
    pub fn alpha(&self) -> Option<Raster> {
        if self.channels != 4 {
            return None;
        }
        let mut out = Raster::new(self.width, self.height, 1);
        for y in 0..self.height {
            for x in 0..self.width {
                out.set(x, y, 0, self.get(x, y, 3));
            }
        }
        Some(out)
    }

    /// First three channels of `self` with `mask`'s first channel attached
    /// as alpha.
    pub fn with_alpha(&self, mask: &Raster) -> Raster {
        assert!(self.channels >= 3);
        assert_eq!(self.width, mask.width);
        assert_eq!(self.height, mask.height);
        let mut out = Raster::new(self.width, self.height, 4);
        for y in 0..self.height {
            for x in 0..self.width {
                for c in 0..3 {
                    out.set(x, y, c, self.get(x, y, c));
                }
                out.set(x, y, 3, mask.get(x, y, 0));
            }
        }
        out
    }

    /// Multiply the color channels by a per-channel factor, leaving any
    /// alpha channel untouched.
    pub fn scale_rgb(&mut self, ratio: [f64; 3]) {
        assert!(self.channels >= 3);
        for y in 0..self.height {
            for x in 0..self.width {
                for c in 0..3 {
                    let v = self.get(x, y, c) * ratio[c] as f32;
                    self.set(x, y, c, v);
                }
            }
        }
    }

    /// Crop to `[x0, x1) x [y0, y1)`.
    pub fn crop(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> Raster {
        assert!(x0 < x1 && x1 <= self.width);
        assert!(y0 < y1 && y1 <= self.height);
        let mut out = Raster::new(x1 - x0, y1 - y0, self.channels);
        for y in y0..y1 {
            for x in x0..x1 {
                for c in 0..self.channels {
                    out.set(x - x0, y - y0, c, self.get(x, y, c));
                }
            }
        }
        out
    }

    /// Pixels whose first channel is non-zero, as (x, y).
    pub fn nonzero_pixels(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y, 0) > 0.0 {
                    out.push((x, y));
                }
            }
        }
        out
    }
}

pub fn linear_to_srgb(linear: f32) -> f32 {
    let a = 0.055;
    let srgb = if linear <= 0.003_130_8 {
        linear * 12.92
    } else {
        (1.0 + a) * linear.powf(1.0 / 2.4) - a
    };
    srgb.max(0.0).min(1.0)
}

/// Load an image as a normalized raster plus its source bit depth.
/// EXR input is converted linear to sRGB; its reported depth is 8 bits.
pub fn load_image(path: &Path) -> Result<(Raster, BitDepth), Error> {
    if !path.exists() {
        return Err(Error::MissingInput(format!("image {}", path.display())));
    }
    let img = image::open(path)?;
    let (w, h) = (img.width() as usize, img.height() as usize);

    let from_u8 = |data: &[u8], channels: usize| {
        let floats = data.iter().map(|v| *v as f32 / 255.0).collect();
        (
            Raster::from_data(w, h, channels, floats),
            BitDepth::Eight,
        )
    };
    let from_u16 = |data: &[u16], channels: usize| {
        let floats = data.iter().map(|v| *v as f32 / 65535.0).collect();
        (
            Raster::from_data(w, h, channels, floats),
            BitDepth::Sixteen,
        )
    };
    let from_f32 = |data: &[f32], channels: usize| {
        let floats = data.iter().map(|v| linear_to_srgb(*v)).collect();
        (
            Raster::from_data(w, h, channels, floats),
            BitDepth::Eight,
        )
    };

    let out = match &img {
        DynamicImage::ImageLuma8(b) => from_u8(b.as_raw(), 1),
        DynamicImage::ImageRgb8(b) => from_u8(b.as_raw(), 3),
        DynamicImage::ImageRgba8(b) => from_u8(b.as_raw(), 4),
        DynamicImage::ImageLuma16(b) => from_u16(b.as_raw(), 1),
        DynamicImage::ImageRgb16(b) => from_u16(b.as_raw(), 3),
        DynamicImage::ImageRgba16(b) => from_u16(b.as_raw(), 4),
        DynamicImage::ImageRgb32F(b) => from_f32(b.as_raw(), 3),
        DynamicImage::ImageRgba32F(b) => from_f32(b.as_raw(), 4),
        DynamicImage::ImageLumaA8(_) => from_u8(img.to_luma8().as_raw(), 1),
        DynamicImage::ImageLumaA16(_) => from_u16(img.to_luma16().as_raw(), 1),
        _ => from_u8(img.to_rgba8().as_raw(), 4),
    };
    Ok(out)
}

/// Write a raster as PNG at the requested bit depth.
pub fn save_image(path: &Path, raster: &Raster, depth: BitDepth) -> Result<(), Error> {
    let color = match (raster.channels, depth) {
        (1, BitDepth::Eight) => ColorType::L8,
        (3, BitDepth::Eight) => ColorType::Rgb8,
        (4, BitDepth::Eight) => ColorType::Rgba8,
        (1, BitDepth::Sixteen) => ColorType::L16,
        (3, BitDepth::Sixteen) => ColorType::Rgb16,
        (4, BitDepth::Sixteen) => ColorType::Rgba16,
        (c, _) => {
            return Err(Error::ParseError(format!(
                "cannot write {} channel image",
                c
            )));
        }
    };

    let max = depth.max_value();
    let quantize = |v: f32| (v.max(0.0).min(1.0) * max + 0.5).floor();
    let bytes: Vec<u8> = match depth {
        BitDepth::Eight => raster.data.iter().map(|v| quantize(*v) as u8).collect(),
        BitDepth::Sixteen => raster
            .data
            .iter()
            .flat_map(|v| (quantize(*v) as u16).to_ne_bytes().to_vec())
            .collect(),
    };

    let file = BufWriter::new(File::create(path)?);
    let encoder = PngEncoder::new_with_quality(file, CompressionType::Fast, FilterType::NoFilter);
    encoder.write_image(&bytes, raster.width as u32, raster.height as u32, color)?;
    Ok(())
}

/// Decode a normal map: [0,1] to [-1,1] with the y and z axes flipped.
pub fn load_normal(path: &Path) -> Result<(Raster, BitDepth), Error> {
    let (mut raster, depth) = load_image(path)?;
    assert!(raster.channels >= 3);
    for y in 0..raster.height {
        for x in 0..raster.width {
            for c in 0..3 {
                let v = raster.get(x, y, c) * 2.0 - 1.0;
                raster.set(x, y, c, if c == 0 { v } else { -v });
            }
        }
    }
    Ok((raster, depth))
}

/// Encode a normal map, inverse of [`load_normal`].
pub fn save_normal(path: &Path, normal: &Raster, depth: BitDepth) -> Result<(), Error> {
    let mut encoded = Raster::new(normal.width, normal.height, normal.channels);
    for y in 0..normal.height {
        for x in 0..normal.width {
            for c in 0..normal.channels {
                let v = normal.get(x, y, c);
                let v = if c == 1 || c == 2 { -v } else { v };
                encoded.set(x, y, c, if c < 3 { (v + 1.0) / 2.0 } else { v });
            }
        }
    }
    save_image(path, &encoded, depth)
}

/// Threshold a mask image to exact 0/1 values on its first channel.
pub fn binarize_mask(mask: &Raster) -> Raster {
    let mut out = Raster::new(mask.width, mask.height, 1);
    for y in 0..mask.height {
        for x in 0..mask.width {
            let v = if mask.get(x, y, 0) > MASK_THRESHOLD {
                1.0
            } else {
                0.0
            };
            out.set(x, y, 0, v);
        }
    }
    out
}

/// Image files in a folder, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    if !dir.is_dir() {
        return Err(Error::MissingInput(format!("folder {}", dir.display())));
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| {
                    let e = e.to_ascii_lowercase();
                    e == "png" || e == "jpg" || e == "jpeg" || e == "exr"
                })
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

#[test]
fn test_bilinear() {
    let mut r = Raster::new(2, 2, 1);
    r.set(0, 0, 0, 0.0);
    r.set(1, 0, 0, 1.0);
    r.set(0, 1, 0, 0.0);
    r.set(1, 1, 0, 1.0);
    assert!((r.bilinear(0.5, 0.5, 0) - 0.5).abs() < 1e-6);
    assert!((r.bilinear(0.0, 0.0, 0) - 0.0).abs() < 1e-6);
    assert!((r.bilinear(1.0, 1.0, 0) - 1.0).abs() < 1e-6);
    assert!((r.bilinear(0.25, 0.0, 0) - 0.25).abs() < 1e-6);
}

#[test]
fn test_png_round_trip_16_bit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x.png");

    let mut r = Raster::new(3, 2, 4);
    for y in 0..2 {
        for x in 0..3 {
            for c in 0..4 {
                r.set(x, y, c, ((x + y * 3) * 4 + c) as f32 * 1000.0 / 65535.0);
            }
        }
    }
    save_image(&path, &r, BitDepth::Sixteen).unwrap();
    let (back, depth) = load_image(&path).unwrap();
    assert_eq!(depth, BitDepth::Sixteen);
    assert_eq!(back.channels(), 4);
    for y in 0..2 {
        for x in 0..3 {
            for c in 0..4 {
                assert!((back.get(x, y, c) - r.get(x, y, c)).abs() < 1e-6);
            }
        }
    }
}

#[test]
fn test_normal_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("n.png");

    let mut n = Raster::new(2, 1, 3);
    n.set(0, 0, 0, 0.5);
    n.set(0, 0, 1, -0.5);
    n.set(0, 0, 2, 1.0 / 65535.0 * 32768.0 * 2.0 - 1.0);
    n.set(1, 0, 0, -1.0);
    n.set(1, 0, 1, 1.0);
    n.set(1, 0, 2, 0.0);
    save_normal(&path, &n, BitDepth::Sixteen).unwrap();
    let (back, _) = load_normal(&path).unwrap();
    for x in 0..2 {
        for c in 0..3 {
            assert!(
                (back.get(x, 0, c) - n.get(x, 0, c)).abs() < 2.0 / 65535.0,
                "channel {} at {}: {} vs {}",
                c,
                x,
                back.get(x, 0, c),
                n.get(x, 0, c)
            );
        }
    }
}

#[test]
fn test_binarize_mask() {
    let mut m = Raster::new(3, 1, 1);
    m.set(0, 0, 0, 0.0);
    m.set(1, 0, 0, 0.2);
    m.set(2, 0, 0, 0.8);
    let b = binarize_mask(&m);
    assert_eq!(b.get(0, 0, 0), 0.0);
    assert_eq!(b.get(1, 0, 0), 0.0);
    assert_eq!(b.get(2, 0, 0), 1.0);
    assert_eq!(b.nonzero_pixels(), vec![(2, 0)]);
}
