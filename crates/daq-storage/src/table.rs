//! Columnar tables filled by decoders.
//!
//! A [`Table`] is an ordered set of named columns sharing one row capacity.
//! Four column shapes exist:
//!
//! - [`Array`]: one element per row
//! - [`FixedArray`]: `length` elements per row, stored densely
//! - [`RaggedArray`]: a variable number of elements per row, stored as one
//!   flattened arena plus per-row cumulative lengths
//! - [`WaveformTable`]: a `values` fixed array with per-row `t0` and `dt`
//!
//! Tables are allocated once and rewritten in place. Nothing here tracks a
//! write cursor; that is the job of the owning buffer.

use daq_core::{DType, Scalar, StorageError};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form attributes attached to a column (units, storage hints, ...).
pub type Attrs = BTreeMap<String, Value>;

// =============================================================================
// Element Storage
// =============================================================================

/// A primitive that can live in a [`ColumnData`].
pub trait Element: Copy + Default + PartialEq + 'static {
    const DTYPE: DType;

    fn from_scalar(value: Scalar) -> Self;
    fn to_scalar(self) -> Scalar;
    fn slice(data: &ColumnData) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $cast:ident, $scalar:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn from_scalar(value: Scalar) -> Self {
                value.$cast() as $t
            }

            fn to_scalar(self) -> Scalar {
                Scalar::$scalar(self.into())
            }

            fn slice(data: &ColumnData) -> Option<&[Self]> {
                match data {
                    ColumnData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(u8, U8, as_u64, UInt);
impl_element!(u16, U16, as_u64, UInt);
impl_element!(u32, U32, as_u64, UInt);
impl_element!(u64, U64, as_u64, UInt);
impl_element!(i8, I8, as_i64, Int);
impl_element!(i16, I16, as_i64, Int);
impl_element!(i32, I32, as_i64, Int);
impl_element!(i64, I64, as_i64, Int);
impl_element!(f32, F32, as_f64, Float);
impl_element!(f64, F64, as_f64, Float);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn from_scalar(value: Scalar) -> Self {
        value.as_bool()
    }

    fn to_scalar(self) -> Scalar {
        Scalar::Bool(self)
    }

    fn slice(data: &ColumnData) -> Option<&[Self]> {
        match data {
            ColumnData::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// Typed element storage for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! each_variant {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Bool($v) => $body,
            ColumnData::U8($v) => $body,
            ColumnData::U16($v) => $body,
            ColumnData::U32($v) => $body,
            ColumnData::U64($v) => $body,
            ColumnData::I8($v) => $body,
            ColumnData::I16($v) => $body,
            ColumnData::I32($v) => $body,
            ColumnData::I64($v) => $body,
            ColumnData::F32($v) => $body,
            ColumnData::F64($v) => $body,
        }
    };
}

impl ColumnData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Bool => ColumnData::Bool(vec![false; len]),
            DType::U8 => ColumnData::U8(vec![0; len]),
            DType::U16 => ColumnData::U16(vec![0; len]),
            DType::U32 => ColumnData::U32(vec![0; len]),
            DType::U64 => ColumnData::U64(vec![0; len]),
            DType::I8 => ColumnData::I8(vec![0; len]),
            DType::I16 => ColumnData::I16(vec![0; len]),
            DType::I32 => ColumnData::I32(vec![0; len]),
            DType::I64 => ColumnData::I64(vec![0; len]),
            DType::F32 => ColumnData::F32(vec![0.0; len]),
            DType::F64 => ColumnData::F64(vec![0.0; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            ColumnData::Bool(_) => DType::Bool,
            ColumnData::U8(_) => DType::U8,
            ColumnData::U16(_) => DType::U16,
            ColumnData::U32(_) => DType::U32,
            ColumnData::U64(_) => DType::U64,
            ColumnData::I8(_) => DType::I8,
            ColumnData::I16(_) => DType::I16,
            ColumnData::I32(_) => DType::I32,
            ColumnData::I64(_) => DType::I64,
            ColumnData::F32(_) => DType::F32,
            ColumnData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`, widened to a [`Scalar`].
    pub fn get(&self, index: usize) -> Option<Scalar> {
        each_variant!(self, v => v.get(index).map(|x| x.to_scalar()))
    }

    /// Cast `value` into the column type and store it at `index`.
    pub fn set(&mut self, index: usize, value: Scalar) -> Result<(), StorageError> {
        let capacity = self.len();
        each_variant!(self, v => {
            let slot = v.get_mut(index).ok_or(StorageError::RowOutOfRange {
                row: index,
                capacity,
            })?;
            *slot = Element::from_scalar(value);
            Ok(())
        })
    }

    /// Write consecutive elements starting at `start`; returns how many were written.
    pub fn write_from<I>(&mut self, start: usize, values: I) -> Result<usize, StorageError>
    where
        I: IntoIterator,
        I::Item: Into<Scalar>,
    {
        let capacity = self.len();
        each_variant!(self, v => {
            let mut written = 0;
            for value in values {
                let slot = v.get_mut(start + written).ok_or(StorageError::RowOutOfRange {
                    row: start + written,
                    capacity,
                })?;
                *slot = Element::from_scalar(value.into());
                written += 1;
            }
            Ok(written)
        })
    }

    /// Reset `start..end` to zero. Indices past the end are ignored.
    pub fn zero_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.len());
        if start >= end {
            return;
        }
        each_variant!(self, v => v[start..end].fill(Default::default()))
    }

    /// Grow to `len` elements, zero filled. Never shrinks.
    pub fn grow_to(&mut self, len: usize) {
        each_variant!(self, v => {
            if v.len() < len {
                v.resize(len, Default::default());
            }
        })
    }

    /// Typed view of the elements.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }
}

// =============================================================================
// Columns
// =============================================================================

/// One element per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub data: ColumnData,
    pub datatype: String,
    pub attrs: Attrs,
}

impl Array {
    pub fn new(dtype: DType, size: usize) -> Self {
        let datatype = if dtype == DType::Bool {
            "array<1>{bool}"
        } else {
            "array<1>{real}"
        };
        Self {
            data: ColumnData::zeros(dtype, size),
            datatype: datatype.to_string(),
            attrs: Attrs::new(),
        }
    }

    /// Array with every element set to `value`.
    pub fn filled(dtype: DType, size: usize, value: Scalar) -> Self {
        let mut array = Self::new(dtype, size);
        // Writing `size` elements into a column of `size` rows cannot overflow.
        let _ = array.data.write_from(0, std::iter::repeat(value).take(size));
        array
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `length` elements per row, stored densely (`size × length`).
#[derive(Debug, Clone, PartialEq)]
pub struct FixedArray {
    pub data: ColumnData,
    pub size: usize,
    pub length: usize,
    pub datatype: String,
    pub attrs: Attrs,
}

impl FixedArray {
    pub fn new(dtype: DType, size: usize, length: usize) -> Self {
        Self {
            data: ColumnData::zeros(dtype, size * length),
            size,
            length,
            datatype: "array_of_equalsized_arrays<1,1>{real}".to_string(),
            attrs: Attrs::new(),
        }
    }

    /// Overwrite `row`; elements past the input are zeroed.
    pub fn set_row<I>(&mut self, row: usize, values: I) -> Result<usize, StorageError>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        I::Item: Into<Scalar>,
    {
        if row >= self.size {
            return Err(StorageError::RowOutOfRange {
                row,
                capacity: self.size,
            });
        }
        let values = values.into_iter();
        if values.len() > self.length {
            return Err(StorageError::RowTooLong {
                len: values.len(),
                width: self.length,
            });
        }
        let start = row * self.length;
        let written = self.data.write_from(start, values)?;
        self.data.zero_range(start + written, start + self.length);
        Ok(written)
    }

    /// Typed view of one row.
    pub fn row<T: Element>(&self, row: usize) -> Option<&[T]> {
        let start = row.checked_mul(self.length)?;
        self.data.as_slice::<T>()?.get(start..start + self.length)
    }
}

/// Variable-length rows over a flattened arena.
///
/// `cumulative_length[i]` is the arena end of row `i`. The arena grows
/// geometrically on demand and is never shrunk, so a buffer that is flushed
/// and refilled keeps its high-water allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RaggedArray {
    pub flattened: ColumnData,
    pub cumulative_length: Vec<u64>,
    pub datatype: String,
    pub attrs: Attrs,
}

impl RaggedArray {
    pub fn new(dtype: DType, size: usize, length_guess: usize) -> Self {
        Self {
            flattened: ColumnData::zeros(dtype, size * length_guess),
            cumulative_length: vec![0; size],
            datatype: "array<1>{array<1>{real}}".to_string(),
            attrs: Attrs::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.cumulative_length.len()
    }

    fn row_start(&self, row: usize) -> usize {
        if row == 0 {
            0
        } else {
            self.cumulative_length[row - 1] as usize
        }
    }

    /// Store `values` as row `row`, which must directly follow row `row - 1`.
    pub fn set_row<I>(&mut self, row: usize, values: I) -> Result<usize, StorageError>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        I::Item: Into<Scalar>,
    {
        if row >= self.size() {
            return Err(StorageError::RowOutOfRange {
                row,
                capacity: self.size(),
            });
        }
        let values = values.into_iter();
        let start = self.row_start(row);
        let end = start + values.len();
        if end > self.flattened.len() {
            let mut capacity = self.flattened.len().max(1);
            while capacity < end {
                capacity *= 2;
            }
            self.flattened.grow_to(capacity);
        }
        self.flattened.write_from(start, values)?;
        self.cumulative_length[row] = end as u64;
        Ok(end - start)
    }

    /// Typed view of one row.
    pub fn row<T: Element>(&self, row: usize) -> Option<&[T]> {
        let end = *self.cumulative_length.get(row)? as usize;
        let start = self.row_start(row);
        self.flattened.as_slice::<T>()?.get(start..end)
    }
}

/// Waveform composite: per-row `t0` and `dt` plus a fixed-width `values` row.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformTable {
    pub t0: Array,
    pub dt: Array,
    pub values: FixedArray,
    pub attrs: Attrs,
}

impl WaveformTable {
    /// `t0` starts at zero; every row of `dt` is prefilled with `dt`.
    pub fn new(
        dtype: DType,
        size: usize,
        wf_len: usize,
        t0_units: &str,
        dt: f64,
        dt_units: &str,
    ) -> Self {
        let mut t0 = Array::new(DType::F64, size);
        t0.attrs.insert("units".into(), Value::from(t0_units));
        let mut dt_col = Array::filled(DType::F64, size, Scalar::Float(dt));
        dt_col.attrs.insert("units".into(), Value::from(dt_units));
        Self {
            t0,
            dt: dt_col,
            values: FixedArray::new(dtype, size, wf_len),
            attrs: Attrs::new(),
        }
    }

    pub fn wf_len(&self) -> usize {
        self.values.length
    }

    /// Sub-column by name (`values`, `t0` or `dt`) attributes.
    pub fn sub_attrs_mut(&mut self, name: &str) -> Option<&mut Attrs> {
        match name {
            "values" => Some(&mut self.values.attrs),
            "t0" => Some(&mut self.t0.attrs),
            "dt" => Some(&mut self.dt.attrs),
            _ => None,
        }
    }
}

/// A table column of any shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Array(Array),
    Fixed(FixedArray),
    Ragged(RaggedArray),
    Waveform(WaveformTable),
}

impl Column {
    /// Datatype label recorded with the column.
    pub fn datatype(&self) -> &str {
        match self {
            Column::Array(a) => &a.datatype,
            Column::Fixed(a) => &a.datatype,
            Column::Ragged(a) => &a.datatype,
            Column::Waveform(_) => "table{t0,dt,values}",
        }
    }

    pub fn attrs(&self) -> &Attrs {
        match self {
            Column::Array(a) => &a.attrs,
            Column::Fixed(a) => &a.attrs,
            Column::Ragged(a) => &a.attrs,
            Column::Waveform(w) => &w.attrs,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Column::Array(a) => a.data.dtype(),
            Column::Fixed(a) => a.data.dtype(),
            Column::Ragged(a) => a.flattened.dtype(),
            Column::Waveform(w) => w.values.data.dtype(),
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// Ordered named columns with a shared row capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    size: usize,
    fields: Vec<(String, Column)>,
}

impl Table {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            fields: Vec::new(),
        }
    }

    /// Row capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn add_field(&mut self, name: impl Into<String>, column: Column) {
        self.fields.push((name.into(), column));
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.fields.iter().map(|(name, col)| (name.as_str(), col))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    fn not_found(name: &str) -> StorageError {
        StorageError::FieldNotFound {
            field: name.to_string(),
        }
    }

    pub fn array(&self, name: &str) -> Result<&Array, StorageError> {
        match self.get(name) {
            Some(Column::Array(a)) => Ok(a),
            Some(_) => Err(wrong_kind(name, "flat array")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn array_mut(&mut self, name: &str) -> Result<&mut Array, StorageError> {
        match self.get_mut(name) {
            Some(Column::Array(a)) => Ok(a),
            Some(_) => Err(wrong_kind(name, "flat array")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn fixed(&self, name: &str) -> Result<&FixedArray, StorageError> {
        match self.get(name) {
            Some(Column::Fixed(a)) => Ok(a),
            Some(_) => Err(wrong_kind(name, "fixed-width array")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn fixed_mut(&mut self, name: &str) -> Result<&mut FixedArray, StorageError> {
        match self.get_mut(name) {
            Some(Column::Fixed(a)) => Ok(a),
            Some(_) => Err(wrong_kind(name, "fixed-width array")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn ragged(&self, name: &str) -> Result<&RaggedArray, StorageError> {
        match self.get(name) {
            Some(Column::Ragged(a)) => Ok(a),
            Some(_) => Err(wrong_kind(name, "ragged array")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn ragged_mut(&mut self, name: &str) -> Result<&mut RaggedArray, StorageError> {
        match self.get_mut(name) {
            Some(Column::Ragged(a)) => Ok(a),
            Some(_) => Err(wrong_kind(name, "ragged array")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn waveform(&self, name: &str) -> Result<&WaveformTable, StorageError> {
        match self.get(name) {
            Some(Column::Waveform(w)) => Ok(w),
            Some(_) => Err(wrong_kind(name, "waveform")),
            None => Err(Self::not_found(name)),
        }
    }

    pub fn waveform_mut(&mut self, name: &str) -> Result<&mut WaveformTable, StorageError> {
        match self.get_mut(name) {
            Some(Column::Waveform(w)) => Ok(w),
            Some(_) => Err(wrong_kind(name, "waveform")),
            None => Err(Self::not_found(name)),
        }
    }

    /// Store a scalar into a flat column.
    pub fn set(
        &mut self,
        name: &str,
        row: usize,
        value: impl Into<Scalar>,
    ) -> Result<(), StorageError> {
        self.array_mut(name)?.data.set(row, value.into())
    }

    /// Like [`Table::set`], but a missing column is not an error.
    ///
    /// Returns whether the column exists.
    pub fn set_if_present(
        &mut self,
        name: &str,
        row: usize,
        value: impl Into<Scalar>,
    ) -> Result<bool, StorageError> {
        if !self.contains(name) {
            return Ok(false);
        }
        self.set(name, row, value)?;
        Ok(true)
    }

    /// Read a scalar from a flat column.
    pub fn scalar(&self, name: &str, row: usize) -> Result<Scalar, StorageError> {
        let array = self.array(name)?;
        array.data.get(row).ok_or(StorageError::RowOutOfRange {
            row,
            capacity: array.len(),
        })
    }
}

fn wrong_kind(name: &str, expected: &'static str) -> StorageError {
    StorageError::WrongKind {
        field: name.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_set_casts_into_dtype() {
        let mut data = ColumnData::zeros(DType::U16, 4);
        data.set(1, Scalar::Float(12.7)).unwrap();
        data.set(2, Scalar::from(70_000u32)).unwrap();
        assert_eq!(data.as_slice::<u16>().unwrap(), &[0, 12, 70_000u32 as u16, 0]);
        assert!(data.set(4, Scalar::from(1u8)).is_err());
        assert!(data.as_slice::<u32>().is_none());
    }

    #[test]
    fn test_fixed_array_rows() {
        let mut fixed = FixedArray::new(DType::I32, 3, 4);
        assert_eq!(fixed.data.len(), 12);
        fixed.set_row(1, [1i32, 2, 3]).unwrap();
        assert_eq!(fixed.row::<i32>(1).unwrap(), &[1, 2, 3, 0]);
        assert!(matches!(
            fixed.set_row(0, [0i32; 5]),
            Err(StorageError::RowTooLong { len: 5, width: 4 })
        ));
        assert!(fixed.set_row(3, [1i32]).is_err());
    }

    #[test]
    fn test_fixed_row_reuse_clears_tail() {
        let mut fixed = FixedArray::new(DType::U16, 2, 4);
        fixed.set_row(0, [9u16, 9, 9, 9]).unwrap();
        fixed.set_row(1, [7u16; 4]).unwrap();
        // Next chunk: a shorter row lands on the same slot.
        assert_eq!(fixed.set_row(0, [1u16, 2]).unwrap(), 2);
        assert_eq!(fixed.row::<u16>(0).unwrap(), &[1, 2, 0, 0]);
        assert_eq!(fixed.row::<u16>(1).unwrap(), &[7, 7, 7, 7]);
    }

    #[test]
    fn test_ragged_array_grows_and_keeps_capacity() {
        let mut ragged = RaggedArray::new(DType::U8, 4, 2);
        assert_eq!(ragged.flattened.len(), 8);
        ragged.set_row(0, [1u8, 2, 3]).unwrap();
        ragged.set_row(1, vec![4u8; 10]).unwrap();
        assert_eq!(&ragged.cumulative_length[..2], &[3, 13]);
        assert_eq!(ragged.flattened.len(), 16);
        assert_eq!(ragged.row::<u8>(0).unwrap(), &[1, 2, 3]);
        assert_eq!(ragged.row::<u8>(1).unwrap().len(), 10);

        // Rewriting from the first row after a flush does not shrink the arena.
        ragged.set_row(0, [9u8]).unwrap();
        assert_eq!(ragged.flattened.len(), 16);
        assert_eq!(ragged.row::<u8>(0).unwrap(), &[9]);
    }

    #[test]
    fn test_ragged_array_with_zero_guess() {
        let mut ragged = RaggedArray::new(DType::U16, 2, 0);
        ragged.set_row(0, [5u16, 6]).unwrap();
        assert_eq!(ragged.row::<u16>(0).unwrap(), &[5, 6]);
        ragged.set_row(1, std::iter::empty::<u16>()).unwrap();
        assert_eq!(ragged.row::<u16>(1).unwrap(), &[] as &[u16]);
    }

    #[test]
    fn test_waveform_table_layout() {
        let wf = WaveformTable::new(DType::U16, 5, 100, "ns", 16.0, "ns");
        assert_eq!(wf.wf_len(), 100);
        assert_eq!(wf.values.data.len(), 500);
        assert_eq!(wf.t0.data.as_slice::<f64>().unwrap(), &[0.0; 5]);
        assert_eq!(wf.dt.data.as_slice::<f64>().unwrap(), &[16.0; 5]);
        assert_eq!(wf.dt.attrs["units"], "ns");
    }

    #[test]
    fn test_table_access_by_kind() {
        let mut table = Table::new(2);
        table.add_field("energy", Column::Array(Array::new(DType::F32, 2)));
        table.add_field(
            "waveform",
            Column::Waveform(WaveformTable::new(DType::U16, 2, 8, "ns", 4.0, "ns")),
        );
        table.set("energy", 1, 2.5f64).unwrap();
        assert_eq!(table.scalar("energy", 1).unwrap(), Scalar::Float(2.5));
        assert!(!table.set_if_present("missing", 0, 1u8).unwrap());
        assert!(matches!(
            table.set("waveform", 0, 1u8),
            Err(StorageError::WrongKind { .. })
        ));
        assert!(matches!(
            table.array("missing"),
            Err(StorageError::FieldNotFound { .. })
        ));
        assert_eq!(
            table.field_names().collect::<Vec<_>>(),
            vec!["energy", "waveform"]
        );
    }
}
