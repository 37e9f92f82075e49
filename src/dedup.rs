//! Deduplication of per-view intrinsics and poses.
//!
//! Turntable rigs repeat the same physical camera across many views, and the
//! SfM-style output layouts reference shared intrinsic/pose tables by id
//! instead of duplicating them per view. Matching is within tolerance: the
//! first existing record that matches wins, in insertion order.

extern crate nalgebra as na;

use na::{Matrix3, Vector3};

/// Absolute tolerance for focal length and principal point comparison.
const ABS_TOL: f64 = 1e-2;
/// Relative tolerance for rotation and center comparison.
const REL_TOL: f64 = 1e-2;

fn close_abs(a: f64, b: f64) -> bool {
    (a - b).abs() < ABS_TOL
}

fn close_rel(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + REL_TOL * b.abs()
}

/// How a camera's focal information is expressed. Kinds never match across
/// variants.
#[derive(Debug, Clone, PartialEq)]
pub enum IntrinsicKind {
    /// Focal length in pixels, per axis.
    PixelFocal { fx: f64, fy: f64 },
    /// Focal length in millimeters with the physical sensor size.
    SensorFocal {
        focal_mm: f64,
        sensor_w: f64,
        sensor_h: f64,
    },
    /// No focal information, only the principal point is known.
    PrincipalOnly,
}

impl IntrinsicKind {
    fn matches(&self, other: &IntrinsicKind) -> bool {
        match (self, other) {
            (
                IntrinsicKind::PixelFocal { fx, fy },
                IntrinsicKind::PixelFocal {
                    fx: ofx,
                    fy: ofy,
                },
            ) => close_abs(*fx, *ofx) && close_abs(*fy, *ofy),
            (
                IntrinsicKind::SensorFocal { focal_mm, .. },
                IntrinsicKind::SensorFocal {
                    focal_mm: other_mm, ..
                },
            ) => close_abs(*focal_mm, *other_mm),
            (IntrinsicKind::PrincipalOnly, IntrinsicKind::PrincipalOnly) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntrinsicRecord {
    pub width: u32,
    pub height: u32,
    pub kind: IntrinsicKind,
    /// Principal point offset from the image center, in pixels.
    pub principal: (f64, f64),
}

impl IntrinsicRecord {
    fn matches(&self, other: &IntrinsicRecord) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.kind.matches(&other.kind)
            && close_abs(self.principal.0, other.principal.0)
            && close_abs(self.principal.1, other.principal.1)
    }
}

#[derive(Debug, Clone)]
pub struct PoseRecord {
    pub rotation: Matrix3<f64>,
    pub center: Vector3<f64>,
}

impl PoseRecord {
    fn matches(&self, other: &PoseRecord) -> bool {
        self.rotation
            .iter()
            .zip(other.rotation.iter())
            .all(|(a, b)| close_rel(*a, *b))
            && self
                .center
                .iter()
                .zip(other.center.iter())
                .all(|(a, b)| close_rel(*a, *b))
    }
}

/// Insertion-order intrinsic table; `insert` returns the id of the first
/// matching record, allocating a new id if none matches.
#[derive(Debug, Clone, Default)]
pub struct IntrinsicTable {
    entries: Vec<IntrinsicRecord>,
}

impl IntrinsicTable {
    pub fn new() -> Self {
        IntrinsicTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, record: IntrinsicRecord) -> usize {
        for (id, existing) in self.entries.iter().enumerate() {
            if existing.matches(&record) {
                return id;
            }
        }
        self.entries.push(record);
        self.entries.len() - 1
    }

    pub fn get(&self, id: usize) -> &IntrinsicRecord {
        &self.entries[id]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Insertion-order pose table, `insert` semantics as [`IntrinsicTable`].
#[derive(Debug, Clone, Default)]
pub struct PoseTable {
    entries: Vec<PoseRecord>,
}

impl PoseTable {
    pub fn new() -> Self {
        PoseTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, record: PoseRecord) -> usize {
        for (id, existing) in self.entries.iter().enumerate() {
            if existing.matches(&record) {
                return id;
            }
        }
        self.entries.push(record);
        self.entries.len() - 1
    }

    pub fn get(&self, id: usize) -> &PoseRecord {
        &self.entries[id]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
fn pixel_record(fx: f64, fy: f64) -> IntrinsicRecord {
    IntrinsicRecord {
        width: 1920,
        height: 1080,
        kind: IntrinsicKind::PixelFocal { fx, fy },
        principal: (0.25, -0.5),
    }
}

#[test]
fn test_intrinsic_dedup_idempotent() {
    let mut table = IntrinsicTable::new();
    let a = table.insert(pixel_record(1200.0, 1200.0));
    let b = table.insert(pixel_record(1200.0, 1200.0));
    assert_eq!(a, b);
    assert_eq!(table.len(), 1);

    // within tolerance still matches
    let c = table.insert(pixel_record(1200.005, 1200.0));
    assert_eq!(a, c);
}

#[test]
fn test_intrinsic_dedup_distinct() {
    let mut table = IntrinsicTable::new();
    let a = table.insert(pixel_record(1200.0, 1200.0));
    let b = table.insert(pixel_record(1250.0, 1200.0));
    assert_ne!(a, b);
    assert_eq!(table.len(), 2);

    // same numbers but a different kind never match
    let c = table.insert(IntrinsicRecord {
        width: 1920,
        height: 1080,
        kind: IntrinsicKind::PrincipalOnly,
        principal: (0.25, -0.5),
    });
    assert_ne!(a, c);
    assert_ne!(b, c);
}

#[test]
fn test_intrinsic_dedup_first_match_wins() {
    let mut table = IntrinsicTable::new();
    table.insert(pixel_record(1200.0, 1200.0));
    table.insert(pixel_record(1200.015, 1200.0));
    // 1200.008 is within tolerance of both, the earlier entry wins
    assert_eq!(table.insert(pixel_record(1200.008, 1200.0)), 0);
}

#[test]
fn test_pose_dedup() {
    let mut table = PoseTable::new();
    let pose = PoseRecord {
        rotation: Matrix3::identity(),
        center: Vector3::new(1.0, 2.0, 3.0),
    };
    let a = table.insert(pose.clone());
    let b = table.insert(PoseRecord {
        rotation: Matrix3::identity(),
        center: Vector3::new(1.0, 2.0, 3.005),
    });
    assert_eq!(a, b);

    let c = table.insert(PoseRecord {
        rotation: Matrix3::identity(),
        center: Vector3::new(1.0, 2.0, 4.0),
    });
    assert_ne!(a, c);
}
