// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

//! Tabular views over a [`SamplingProcess`].
//!
//! Rows are sample instants, columns are sources. Reads for rows where the
//! owning block does not include the requested source return
//! [`CellValue::Null`]; out-of-range indices and unknown names are errors,
//! nulls are not.

use crate::query::value::{CellValue, ColumnElement, DataType};
use crate::query::Nanos;
use crate::ErrorKind;

mod dynamic_table;
mod static_table;

pub use dynamic_table::DynamicDataTable;
pub use static_table::StaticDataTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Fully materialized at construction; `O(1)` cell access.
    Static,
    /// Paged over the sampling process; columns materialize on demand.
    Dynamic,
}

/// A query result as a table.
// --
// Same internal "enum dispatch" shape as elsewhere in this codebase: the
// variant set is closed, so an enum beats `dyn` for both clarity and the
// optimizer.
#[derive(Debug)]
pub enum DataTable {
    Static(StaticDataTable),
    Dynamic(DynamicDataTable),
}

impl DataTable {
    pub fn kind(&self) -> TableKind {
        match self {
            DataTable::Static(_) => TableKind::Static,
            DataTable::Dynamic(_) => TableKind::Dynamic,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            DataTable::Static(t) => t.row_count(),
            DataTable::Dynamic(t) => t.row_count(),
        }
    }

    pub fn column_count(&self) -> usize {
        match self {
            DataTable::Static(t) => t.column_count(),
            DataTable::Dynamic(t) => t.column_count(),
        }
    }

    pub fn column_names(&self) -> &[String] {
        match self {
            DataTable::Static(t) => t.column_names(),
            DataTable::Dynamic(t) => t.column_names(),
        }
    }

    pub fn column_name(&self, index: usize) -> crate::Result<&str> {
        match self {
            DataTable::Static(t) => t.column_name(index),
            DataTable::Dynamic(t) => t.column_name(index),
        }
    }

    pub fn column_type(&self, index: usize) -> crate::Result<DataType> {
        match self {
            DataTable::Static(t) => t.column_type(index),
            DataTable::Dynamic(t) => t.column_type(index),
        }
    }

    pub fn column_type_of(&self, name: &str) -> crate::Result<DataType> {
        match self {
            DataTable::Static(t) => t.column_type_of(name),
            DataTable::Dynamic(t) => t.column_type_of(name),
        }
    }

    pub fn timestamp(&self, row: usize) -> crate::Result<Nanos> {
        match self {
            DataTable::Static(t) => t.timestamp(row),
            DataTable::Dynamic(t) => t.timestamp(row),
        }
    }

    pub fn timestamps(&self) -> Vec<Nanos> {
        match self {
            DataTable::Static(t) => t.timestamps().to_vec(),
            DataTable::Dynamic(t) => t.timestamps(),
        }
    }

    pub fn value(&self, row: usize, column: usize) -> crate::Result<CellValue> {
        match self {
            DataTable::Static(t) => t.value(row, column),
            DataTable::Dynamic(t) => t.value(row, column),
        }
    }

    pub fn value_named(&self, row: usize, name: &str) -> crate::Result<CellValue> {
        match self {
            DataTable::Static(t) => t.value_named(row, name),
            DataTable::Dynamic(t) => t.value_named(row, name),
        }
    }

    pub fn row_values(&self, row: usize) -> crate::Result<Vec<CellValue>> {
        match self {
            DataTable::Static(t) => t.row_values(row),
            DataTable::Dynamic(t) => t.row_values(row),
        }
    }

    pub fn column_data(&self, index: usize) -> crate::Result<Vec<CellValue>> {
        match self {
            DataTable::Static(t) => t.column_data(index),
            DataTable::Dynamic(t) => t.column_data(index),
        }
    }

    pub fn column_data_named(&self, name: &str) -> crate::Result<Vec<CellValue>> {
        match self {
            DataTable::Static(t) => t.column_data_named(name),
            DataTable::Dynamic(t) => t.column_data_named(name),
        }
    }

    pub fn column_data_typed<T: ColumnElement>(
        &self,
        index: usize,
    ) -> crate::Result<Vec<Option<T>>> {
        match self {
            DataTable::Static(t) => t.column_data_typed(index),
            DataTable::Dynamic(t) => t.column_data_typed(index),
        }
    }

    pub fn column_data_typed_named<T: ColumnElement>(
        &self,
        name: &str,
    ) -> crate::Result<Vec<Option<T>>> {
        match self {
            DataTable::Static(t) => t.column_data_typed_named(name),
            DataTable::Dynamic(t) => t.column_data_typed_named(name),
        }
    }

    /// Approximate heap bytes held by the table.
    pub fn allocation_size(&self) -> u64 {
        match self {
            DataTable::Static(t) => t.allocation_size(),
            DataTable::Dynamic(t) => t.allocation_size(),
        }
    }
}

/// Resolves a column name against the table's name list.
fn index_of(names: &[String], name: &str) -> crate::Result<usize> {
    names
        .iter()
        .position(|candidate| candidate == name)
        .ok_or_else(|| {
            ErrorKind::NoSuchColumn {
                name: name.to_string(),
            }
            .into()
        })
}

/// Approximate heap bytes of one materialized cell.
fn cell_allocation(cell: &CellValue) -> u64 {
    let heap = match cell {
        CellValue::String(s) => s.len() as u64,
        CellValue::Bytes(b) => b.len() as u64,
        _ => 0,
    };
    std::mem::size_of::<CellValue>() as u64 + heap
}

/// Converts a materialized column for a typed read, after the declared
/// element type has passed the assignability check.
fn cells_to_typed<T: ColumnElement>(cells: &[CellValue]) -> Vec<Option<T>> {
    cells.iter().map(T::from_cell).collect()
}
