// SPDX-License-Identifier: GPL-3.0-only

//! Key/value camera metadata blocks
//!
//! A [`CameraMetadata`] block carries camera settings on requests and scene
//! metadata on results. Values are typed arrays keyed by a numeric tag; the
//! element type is checked on every read so a stage asking for `i32` values
//! of a `f32` tag gets `None` instead of garbage.

use std::collections::BTreeMap;
use std::fmt;

/// Numeric metadata tag (`section << 16 | index`)
pub type Tag = u32;

/// Well-known tags touched by the pipeline core and its built-in helpers
pub mod tags {
    use super::Tag;

    const fn tag(section: u32, index: u32) -> Tag {
        (section << 16) | index
    }

    const CONTROL: u32 = 0x01;
    const REQUEST: u32 = 0x0c;
    const SENSOR: u32 = 0x0e;
    const STATISTICS: u32 = 0x11;

    /// Overall 3A control mode (u8)
    pub const CONTROL_MODE: Tag = tag(CONTROL, 0x12);
    /// Capture intent of the request (u8)
    pub const CONTROL_CAPTURE_INTENT: Tag = tag(CONTROL, 0x0a);
    /// Client-assigned request id (i32)
    pub const REQUEST_ID: Tag = tag(REQUEST, 0x01);
    /// Number of partial results the device emits per frame (i32, static)
    pub const REQUEST_PARTIAL_RESULT_COUNT: Tag = tag(REQUEST, 0x0b);
    /// Start of exposure in nanoseconds (i64)
    pub const SENSOR_TIMESTAMP: Tag = tag(SENSOR, 0x10);
    /// Face detection mode requested by the client (u8)
    pub const STATISTICS_FACE_DETECT_MODE: Tag = tag(STATISTICS, 0x00);
    /// Face rectangles reported in results (i32, 4 per face)
    pub const STATISTICS_FACE_RECTANGLES: Tag = tag(STATISTICS, 0x04);
}

/// Rational metadata value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub numerator: i32,
    pub denominator: i32,
}

/// Typed metadata payload
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Byte(Vec<u8>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Rational(Vec<Rational>),
}

impl MetadataValue {
    /// Number of elements in the value array
    pub fn count(&self) -> usize {
        match self {
            MetadataValue::Byte(v) => v.len(),
            MetadataValue::Int32(v) => v.len(),
            MetadataValue::Int64(v) => v.len(),
            MetadataValue::Float(v) => v.len(),
            MetadataValue::Double(v) => v.len(),
            MetadataValue::Rational(v) => v.len(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            MetadataValue::Byte(_) => "byte",
            MetadataValue::Int32(_) => "int32",
            MetadataValue::Int64(_) => "int64",
            MetadataValue::Float(_) => "float",
            MetadataValue::Double(_) => "double",
            MetadataValue::Rational(_) => "rational",
        }
    }
}

/// Element types that can be stored in a metadata entry
pub trait MetadataType: Sized + Clone {
    fn wrap(values: Vec<Self>) -> MetadataValue;
    fn unwrap(value: &MetadataValue) -> Option<&[Self]>;
}

macro_rules! metadata_type {
    ($ty:ty, $variant:ident) => {
        impl MetadataType for $ty {
            fn wrap(values: Vec<Self>) -> MetadataValue {
                MetadataValue::$variant(values)
            }

            fn unwrap(value: &MetadataValue) -> Option<&[Self]> {
                match value {
                    MetadataValue::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }
        }
    };
}

metadata_type!(u8, Byte);
metadata_type!(i32, Int32);
metadata_type!(i64, Int64);
metadata_type!(f32, Float);
metadata_type!(f64, Double);
metadata_type!(Rational, Rational);

/// Ordered key/value metadata block
#[derive(Clone, Default, PartialEq)]
pub struct CameraMetadata {
    entries: BTreeMap<Tag, MetadataValue>,
}

impl CameraMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Typed view of the values stored under `tag`
    pub fn get<T: MetadataType>(&self, tag: Tag) -> Option<&[T]> {
        self.entries.get(&tag).and_then(T::unwrap)
    }

    /// First value stored under `tag`
    pub fn get_first<T: MetadataType>(&self, tag: Tag) -> Option<T> {
        self.get::<T>(tag).and_then(|v| v.first().cloned())
    }

    /// Raw value stored under `tag`
    pub fn get_raw(&self, tag: Tag) -> Option<&MetadataValue> {
        self.entries.get(&tag)
    }

    /// Insert or replace the values stored under `tag`
    pub fn update<T: MetadataType>(&mut self, tag: Tag, values: impl Into<Vec<T>>) {
        self.entries.insert(tag, T::wrap(values.into()));
    }

    /// Insert or replace a raw value
    pub fn update_raw(&mut self, tag: Tag, value: MetadataValue) {
        self.entries.insert(tag, value);
    }

    /// Remove `tag`; returns whether it was present
    pub fn delete(&mut self, tag: Tag) -> bool {
        self.entries.remove(&tag).is_some()
    }

    /// Copy every entry of `other` into this block, replacing duplicates
    pub fn merge_from(&mut self, other: &CameraMetadata) {
        for (tag, value) in &other.entries {
            self.entries.insert(*tag, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &MetadataValue)> {
        self.entries.iter().map(|(tag, value)| (*tag, value))
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.entries.keys().copied()
    }
}

impl fmt::Debug for CameraMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (tag, value) in &self.entries {
            map.entry(
                &format_args!("{:#08x}", tag),
                &format_args!("{}[{}]", value.type_name(), value.count()),
            );
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut md = CameraMetadata::new();
        md.update::<i32>(tags::REQUEST_ID, vec![42]);
        md.update::<u8>(tags::CONTROL_MODE, [1u8]);

        assert_eq!(md.get_first::<i32>(tags::REQUEST_ID), Some(42));
        assert_eq!(md.get::<u8>(tags::CONTROL_MODE), Some(&[1u8][..]));
        // Wrong element type reads as absent
        assert!(md.get::<f32>(tags::REQUEST_ID).is_none());
        assert_eq!(md.len(), 2);
    }

    #[test]
    fn test_delete_and_merge() {
        let mut a = CameraMetadata::new();
        a.update::<i64>(tags::SENSOR_TIMESTAMP, vec![100]);
        a.update::<i32>(tags::REQUEST_ID, vec![1]);

        let mut b = CameraMetadata::new();
        b.update::<i32>(tags::REQUEST_ID, vec![2]);
        b.update::<u8>(tags::STATISTICS_FACE_DETECT_MODE, vec![0]);

        a.merge_from(&b);
        assert_eq!(a.get_first::<i32>(tags::REQUEST_ID), Some(2));
        assert_eq!(a.len(), 3);

        assert!(a.delete(tags::SENSOR_TIMESTAMP));
        assert!(!a.delete(tags::SENSOR_TIMESTAMP));
        assert!(!a.contains(tags::SENSOR_TIMESTAMP));
    }

    #[test]
    fn test_empty_block_is_distinct_from_absent() {
        let absent: Option<CameraMetadata> = None;
        let empty = Some(CameraMetadata::new());
        assert_ne!(absent, empty);
        assert!(empty.as_ref().is_some_and(CameraMetadata::is_empty));
    }
}
