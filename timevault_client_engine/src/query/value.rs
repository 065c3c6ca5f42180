// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::fmt::Display;

use crate::ErrorKind;

/// The closed set of element types the archive can deliver.
///
/// Anything outside this set is a protocol violation and is rejected with
/// [`ErrorKind::TypeConflict`] before it reaches a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
}

impl DataType {
    /// Whether a column declared as `self` can satisfy a typed read of
    /// `requested`.
    ///
    /// Exact matches always hold; the only widenings permitted are
    /// `Int32 -> Int64` and `Float32 -> Float64`.
    pub fn is_assignable_to(self, requested: DataType) -> bool {
        self == requested
            || matches!(
                (self, requested),
                (DataType::Int32, DataType::Int64) | (DataType::Float32, DataType::Float64)
            )
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "boolean"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Int64 => write!(f, "int64"),
            DataType::Float32 => write!(f, "float32"),
            DataType::Float64 => write!(f, "float64"),
            DataType::String => write!(f, "string"),
            DataType::Bytes => write!(f, "bytes"),
        }
    }
}

/// One source's uniform value sequence, stored columnar.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValues {
    Boolean(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    Bytes(Vec<Vec<u8>>),
}

impl ColumnValues {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnValues::Boolean(_) => DataType::Boolean,
            ColumnValues::Int32(_) => DataType::Int32,
            ColumnValues::Int64(_) => DataType::Int64,
            ColumnValues::Float32(_) => DataType::Float32,
            ColumnValues::Float64(_) => DataType::Float64,
            ColumnValues::String(_) => DataType::String,
            ColumnValues::Bytes(_) => DataType::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Boolean(v) => v.len(),
            ColumnValues::Int32(v) => v.len(),
            ColumnValues::Int64(v) => v.len(),
            ColumnValues::Float32(v) => v.len(),
            ColumnValues::Float64(v) => v.len(),
            ColumnValues::String(v) => v.len(),
            ColumnValues::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A scalar view of one element. Out-of-range indices read as
    /// [`CellValue::Null`]; bounds are the caller's concern.
    pub fn cell(&self, index: usize) -> CellValue {
        match self {
            ColumnValues::Boolean(v) => v.get(index).map(|b| CellValue::Boolean(*b)),
            ColumnValues::Int32(v) => v.get(index).map(|i| CellValue::Int32(*i)),
            ColumnValues::Int64(v) => v.get(index).map(|i| CellValue::Int64(*i)),
            ColumnValues::Float32(v) => v.get(index).map(|x| CellValue::Float32(*x)),
            ColumnValues::Float64(v) => v.get(index).map(|x| CellValue::Float64(*x)),
            ColumnValues::String(v) => v.get(index).map(|s| CellValue::String(s.clone())),
            ColumnValues::Bytes(v) => v.get(index).map(|b| CellValue::Bytes(b.clone())),
        }
        .unwrap_or(CellValue::Null)
    }

    /// Approximate payload bytes, for result-size accounting.
    pub fn byte_size(&self) -> u64 {
        match self {
            ColumnValues::Boolean(v) => v.len() as u64,
            ColumnValues::Int32(v) => v.len() as u64 * 4,
            ColumnValues::Int64(v) => v.len() as u64 * 8,
            ColumnValues::Float32(v) => v.len() as u64 * 4,
            ColumnValues::Float64(v) => v.len() as u64 * 8,
            ColumnValues::String(v) => v.iter().map(|s| s.len() as u64 + 8).sum(),
            ColumnValues::Bytes(v) => v.iter().map(|b| b.len() as u64 + 8).sum(),
        }
    }
}

/// A single table cell.
///
/// [`CellValue::Null`] is the distinguished absent-value representation: it
/// is what reads return for rows where the owning block does not include
/// the requested source. Blocks never invent values.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// The element type of the cell, or `None` for the null sentinel.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            CellValue::Null => None,
            CellValue::Boolean(_) => Some(DataType::Boolean),
            CellValue::Int32(_) => Some(DataType::Int32),
            CellValue::Int64(_) => Some(DataType::Int64),
            CellValue::Float32(_) => Some(DataType::Float32),
            CellValue::Float64(_) => Some(DataType::Float64),
            CellValue::String(_) => Some(DataType::String),
            CellValue::Bytes(_) => Some(DataType::Bytes),
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for bool {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for String {}
    impl Sealed for Vec<u8> {}
}

/// The Rust-side types a table column can be read as.
///
/// Sealed: the element-type set is closed by the wire protocol, so there is
/// nothing for downstream crates to add.
pub trait ColumnElement: private::Sealed + Sized {
    const DATA_TYPE: DataType;

    /// Converts a cell into this element type. `None` for the null sentinel.
    ///
    /// Conversions follow [`DataType::is_assignable_to`]; a cell of a
    /// non-assignable type also yields `None`, but callers check the
    /// column's declared type first so that case surfaces as
    /// [`ErrorKind::TypeMismatch`] rather than silent nulls.
    fn from_cell(cell: &CellValue) -> Option<Self>;
}

impl ColumnElement for bool {
    const DATA_TYPE: DataType = DataType::Boolean;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl ColumnElement for i32 {
    const DATA_TYPE: DataType = DataType::Int32;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Int32(i) => Some(*i),
            _ => None,
        }
    }
}

impl ColumnElement for i64 {
    const DATA_TYPE: DataType = DataType::Int64;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Int32(i) => Some(i64::from(*i)),
            CellValue::Int64(i) => Some(*i),
            _ => None,
        }
    }
}

impl ColumnElement for f32 {
    const DATA_TYPE: DataType = DataType::Float32;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Float32(x) => Some(*x),
            _ => None,
        }
    }
}

impl ColumnElement for f64 {
    const DATA_TYPE: DataType = DataType::Float64;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Float32(x) => Some(f64::from(*x)),
            CellValue::Float64(x) => Some(*x),
            _ => None,
        }
    }
}

impl ColumnElement for String {
    const DATA_TYPE: DataType = DataType::String;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl ColumnElement for Vec<u8> {
    const DATA_TYPE: DataType = DataType::Bytes;

    fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

/// Checks that a column declared as `declared` may serve a typed read of
/// `T`, returning the error the table contract requires otherwise.
pub fn check_assignable<T: ColumnElement>(declared: DataType) -> crate::Result<()> {
    if declared.is_assignable_to(T::DATA_TYPE) {
        Ok(())
    } else {
        Err(ErrorKind::TypeMismatch {
            declared,
            requested: T::DATA_TYPE,
        }
        .into())
    }
}
