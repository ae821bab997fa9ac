//! ImageJ binary `.roi` records.
//!
//! Layout (big-endian):
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | magic `Iout`                           |
//! | 4      | 2    | version                                |
//! | 6      | 1    | ROI type                               |
//! | 8      | 8    | top, left, bottom, right (i16 each)    |
//! | 16     | 2    | coordinate count                       |
//! | 36     | 4    | shape ROI size (composite ROIs)        |
//! | 50     | 2    | options                                |
//! | 60     | 4    | header-2 offset                        |
//! | 64     | 4n   | x then y coordinates, relative (i16)   |
//! | 64+4n  | 8n   | optional sub-pixel x then y (f32)      |
//!
//! Header 2 is 64 bytes; it holds the name offset at +16 and the name
//! length (UTF-16 code units) at +20.

use roiquant_pipeline::{Bounds, Point, RoiShape};

use crate::error::ArchiveError;

const MAGIC: &[u8; 4] = b"Iout";
const HEADER_SIZE: usize = 64;
const HEADER2_SIZE: usize = 64;
const VERSION: i16 = 228;
const SUB_PIXEL_RESOLUTION: u16 = 128;

const TYPE_POLYGON: u8 = 0;
const TYPE_RECT: u8 = 1;
const TYPE_OVAL: u8 = 2;
const TYPE_FREEHAND: u8 = 7;
const TYPE_TRACED: u8 = 8;

/// Geometry stored in a `.roi` record.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// An area shape the pipeline can mask.
    Area(RoiShape),
    /// Lines, points, composites and other non-area types.
    Unsupported {
        /// Raw ImageJ type code.
        kind: u8,
    },
}

/// A decoded `.roi` record.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRoi {
    /// Name from header 2, or `None` if the record carries none.
    pub name: Option<String>,
    /// Shape.
    pub geometry: Geometry,
}

struct Bytes<'a> {
    entry: &'a str,
    data: &'a [u8],
}

impl Bytes<'_> {
    fn slice<const N: usize>(&self, offset: usize) -> Result<[u8; N], ArchiveError> {
        self.data
            .get(offset..offset + N)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or_else(|| self.error(format!("truncated at offset {offset}")))
    }

    fn u8(&self, offset: usize) -> Result<u8, ArchiveError> {
        Ok(self.slice::<1>(offset)?[0])
    }

    fn i16(&self, offset: usize) -> Result<i16, ArchiveError> {
        Ok(i16::from_be_bytes(self.slice(offset)?))
    }

    fn u16(&self, offset: usize) -> Result<u16, ArchiveError> {
        Ok(u16::from_be_bytes(self.slice(offset)?))
    }

    fn i32(&self, offset: usize) -> Result<i32, ArchiveError> {
        Ok(i32::from_be_bytes(self.slice(offset)?))
    }

    fn f32(&self, offset: usize) -> Result<f32, ArchiveError> {
        Ok(f32::from_be_bytes(self.slice(offset)?))
    }

    fn error(&self, reason: impl Into<String>) -> ArchiveError {
        ArchiveError::Decode {
            entry: self.entry.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Decode one `.roi` record. `entry` is only used in error messages.
///
/// # Errors
///
/// Returns [`ArchiveError::Decode`] if the magic is wrong or the record
/// is truncated.
pub fn decode(entry: &str, data: &[u8]) -> Result<DecodedRoi, ArchiveError> {
    let b = Bytes { entry, data };
    if b.slice::<4>(0)? != *MAGIC {
        return Err(b.error("missing Iout magic"));
    }
    let version = b.i16(4)?;
    let kind = b.u8(6)?;
    let top = b.i16(8)?;
    let left = b.i16(10)?;
    let bottom = b.i16(12)?;
    let right = b.i16(14)?;
    let n = usize::from(b.u16(16)?);
    let shape_roi_size = b.i32(36)?;
    let options = b.u16(50)?;

    let bounds = || {
        Bounds::new(
            i32::from(left),
            i32::from(top),
            u32::try_from(i32::from(right) - i32::from(left)).unwrap_or(0),
            u32::try_from(i32::from(bottom) - i32::from(top)).unwrap_or(0),
        )
    };

    let geometry = if shape_roi_size > 0 {
        Geometry::Unsupported { kind }
    } else {
        match kind {
            TYPE_RECT => Geometry::Area(RoiShape::Rectangle(bounds())),
            TYPE_OVAL => Geometry::Area(RoiShape::Oval(bounds())),
            TYPE_POLYGON | TYPE_FREEHAND | TYPE_TRACED => {
                let sub_pixel = version >= 222 && options & SUB_PIXEL_RESOLUTION != 0;
                let mut points = Vec::with_capacity(n);
                for i in 0..n {
                    let point = if sub_pixel {
                        let base = HEADER_SIZE + 4 * n;
                        Point::new(
                            f64::from(b.f32(base + 4 * i)?),
                            f64::from(b.f32(base + 4 * n + 4 * i)?),
                        )
                    } else {
                        Point::new(
                            f64::from(left) + f64::from(b.i16(HEADER_SIZE + 2 * i)?),
                            f64::from(top) + f64::from(b.i16(HEADER_SIZE + 2 * n + 2 * i)?),
                        )
                    };
                    points.push(point);
                }
                Geometry::Area(RoiShape::Polygon(points))
            }
            other => Geometry::Unsupported { kind: other },
        }
    };

    let name = if version >= 218 { read_name(&b)? } else { None };
    Ok(DecodedRoi { name, geometry })
}

fn read_name(b: &Bytes<'_>) -> Result<Option<String>, ArchiveError> {
    let Ok(header2) = usize::try_from(b.i32(60)?) else {
        return Ok(None);
    };
    if header2 == 0 || header2 + HEADER2_SIZE > b.data.len() {
        return Ok(None);
    }
    let (Ok(offset), Ok(length)) = (
        usize::try_from(b.i32(header2 + 16)?),
        usize::try_from(b.i32(header2 + 20)?),
    ) else {
        return Ok(None);
    };
    if offset == 0 || length == 0 || offset + 2 * length > b.data.len() {
        return Ok(None);
    }
    let units: Vec<u16> = (0..length)
        .map(|i| b.u16(offset + 2 * i))
        .collect::<Result<_, _>>()?;
    String::from_utf16(&units)
        .map(Some)
        .map_err(|_| b.error("name is not valid UTF-16"))
}

/// Encode a named shape as a `.roi` record.
///
/// Polygon vertices are stored as integers; if any vertex has a
/// fractional part, sub-pixel coordinates are stored as well.
///
/// # Errors
///
/// Returns [`ArchiveError::Encode`] if a coordinate does not fit the
/// format's 16-bit fields or the polygon has too many vertices.
#[allow(clippy::cast_possible_truncation)]
pub fn encode(name: &str, shape: &RoiShape) -> Result<Vec<u8>, ArchiveError> {
    let err = |reason: &str| ArchiveError::Encode {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    let short = |v: i64| i16::try_from(v).map_err(|_| err("coordinate out of range"));

    let bounds = shape.bounds();
    let left = short(i64::from(bounds.x))?;
    let top = short(i64::from(bounds.y))?;
    let right = short(i64::from(bounds.x) + i64::from(bounds.width))?;
    let bottom = short(i64::from(bounds.y) + i64::from(bounds.height))?;

    let (kind, points): (u8, &[Point]) = match shape {
        RoiShape::Rectangle(_) => (TYPE_RECT, &[]),
        RoiShape::Oval(_) => (TYPE_OVAL, &[]),
        RoiShape::Polygon(points) => (TYPE_POLYGON, points),
    };
    let n = u16::try_from(points.len()).map_err(|_| err("too many vertices"))?;
    let sub_pixel = points
        .iter()
        .any(|p| p.x.fract().abs() > f64::EPSILON || p.y.fract().abs() > f64::EPSILON);

    let mut out = Vec::with_capacity(HEADER_SIZE + 12 * points.len() + HEADER2_SIZE);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.push(kind);
    out.push(0);
    for v in [top, left, bottom, right] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.extend_from_slice(&n.to_be_bytes());
    out.resize(HEADER_SIZE, 0);
    if sub_pixel {
        out[50..52].copy_from_slice(&SUB_PIXEL_RESOLUTION.to_be_bytes());
    }

    let relative = |v: f64, origin: i16| short(v.floor() as i64 - i64::from(origin));
    for p in points {
        out.extend_from_slice(&relative(p.x, left)?.to_be_bytes());
    }
    for p in points {
        out.extend_from_slice(&relative(p.y, top)?.to_be_bytes());
    }
    if sub_pixel {
        for v in points.iter().map(|p| p.x).chain(points.iter().map(|p| p.y)) {
            out.extend_from_slice(&(v as f32).to_be_bytes());
        }
    }

    let header2 = out.len();
    let name_units: Vec<u16> = name.encode_utf16().collect();
    let to_i32 = |v: usize| i32::try_from(v).map_err(|_| err("record too large"));
    out[60..64].copy_from_slice(&to_i32(header2)?.to_be_bytes());
    out.resize(header2 + HEADER2_SIZE, 0);
    let name_offset = out.len();
    out[header2 + 16..header2 + 20].copy_from_slice(&to_i32(name_offset)?.to_be_bytes());
    out[header2 + 20..header2 + 24].copy_from_slice(&to_i32(name_units.len())?.to_be_bytes());
    for unit in name_units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    Ok(out)
}
