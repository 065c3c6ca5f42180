// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use crate::query::value::{check_assignable, CellValue, ColumnElement, DataType};
use crate::query::{Nanos, SamplingProcess};
use crate::ErrorKind;

use super::{cell_allocation, cells_to_typed, index_of};

/// The fully materialized table variant.
///
/// All timestamps and per-source columns are laid out as contiguous
/// vectors at construction; cells the sampling process does not cover are
/// filled with the null sentinel up front. Every read is `O(1)`.
#[derive(Debug)]
pub struct StaticDataTable {
    column_names: Vec<String>,
    column_types: Vec<DataType>,
    timestamps: Vec<Nanos>,
    /// Column-major: `columns[c][r]`.
    columns: Vec<Vec<CellValue>>,
    allocation: u64,
}

impl StaticDataTable {
    pub fn from_process(process: &SamplingProcess) -> Self {
        let column_names = process.source_names().to_vec();
        let column_types = process.source_types().to_vec();
        let timestamps = process.timestamps();

        let mut columns: Vec<Vec<CellValue>> = column_names
            .iter()
            .map(|_| Vec::with_capacity(process.row_count()))
            .collect();
        for block in process.blocks() {
            let rows = block.sample_count();
            for (c, name) in column_names.iter().enumerate() {
                match block.column(name) {
                    Some(values) => {
                        for i in 0..rows {
                            columns[c].push(values.cell(i));
                        }
                    }
                    None => {
                        for _ in 0..rows {
                            columns[c].push(CellValue::Null);
                        }
                    }
                }
            }
        }

        let allocation = timestamps.len() as u64 * 8
            + columns
                .iter()
                .flat_map(|column| column.iter().map(cell_allocation))
                .sum::<u64>();

        Self {
            column_names,
            column_types,
            timestamps,
            columns,
            allocation,
        }
    }

    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn column_name(&self, index: usize) -> crate::Result<&str> {
        self.column_names
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn column_type(&self, index: usize) -> crate::Result<DataType> {
        self.column_types
            .get(index)
            .copied()
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn column_type_of(&self, name: &str) -> crate::Result<DataType> {
        let index = index_of(&self.column_names, name)?;
        Ok(self.column_types[index])
    }

    pub fn timestamp(&self, row: usize) -> crate::Result<Nanos> {
        self.timestamps
            .get(row)
            .copied()
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn timestamps(&self) -> &[Nanos] {
        &self.timestamps
    }

    pub fn value(&self, row: usize, column: usize) -> crate::Result<CellValue> {
        let cells = self
            .columns
            .get(column)
            .ok_or(ErrorKind::IndexOutOfBounds)?;
        cells
            .get(row)
            .cloned()
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn value_named(&self, row: usize, name: &str) -> crate::Result<CellValue> {
        let column = index_of(&self.column_names, name)?;
        self.value(row, column)
    }

    pub fn row_values(&self, row: usize) -> crate::Result<Vec<CellValue>> {
        if row >= self.row_count() {
            return Err(ErrorKind::IndexOutOfBounds.into());
        }
        Ok(self.columns.iter().map(|cells| cells[row].clone()).collect())
    }

    pub fn column_data(&self, index: usize) -> crate::Result<Vec<CellValue>> {
        self.columns
            .get(index)
            .cloned()
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn column_data_named(&self, name: &str) -> crate::Result<Vec<CellValue>> {
        let index = index_of(&self.column_names, name)?;
        self.column_data(index)
    }

    pub fn column_data_typed<T: ColumnElement>(
        &self,
        index: usize,
    ) -> crate::Result<Vec<Option<T>>> {
        check_assignable::<T>(self.column_type(index)?)?;
        Ok(cells_to_typed(&self.columns[index]))
    }

    pub fn column_data_typed_named<T: ColumnElement>(
        &self,
        name: &str,
    ) -> crate::Result<Vec<Option<T>>> {
        let index = index_of(&self.column_names, name)?;
        self.column_data_typed(index)
    }

    pub fn allocation_size(&self) -> u64 {
        self.allocation
    }
}
