// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::query::value::{check_assignable, CellValue, ColumnElement, DataType};
use crate::query::{Nanos, SamplingProcess};
use crate::ErrorKind;

use super::{cell_allocation, cells_to_typed, index_of};

/// The paged table variant, backed directly by the sampling process.
///
/// Single-cell reads translate the table row to `(page, row within page)`
/// through the process's precomputed row offsets and never materialize a
/// column. Whole-column reads materialize on first use and are memoized
/// per source.
#[derive(Debug)]
pub struct DynamicDataTable {
    process: Arc<SamplingProcess>,
    column_cache: Mutex<HashMap<String, Arc<Vec<CellValue>>>>,
}

impl DynamicDataTable {
    pub fn new(process: Arc<SamplingProcess>) -> Self {
        Self {
            process,
            column_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn process(&self) -> &Arc<SamplingProcess> {
        &self.process
    }

    pub fn row_count(&self) -> usize {
        self.process.row_count()
    }

    pub fn column_count(&self) -> usize {
        self.process.source_names().len()
    }

    pub fn column_names(&self) -> &[String] {
        self.process.source_names()
    }

    pub fn column_name(&self, index: usize) -> crate::Result<&str> {
        self.process
            .source_names()
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn column_type(&self, index: usize) -> crate::Result<DataType> {
        self.process
            .source_types()
            .get(index)
            .copied()
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn column_type_of(&self, name: &str) -> crate::Result<DataType> {
        let index = index_of(self.process.source_names(), name)?;
        Ok(self.process.source_types()[index])
    }

    pub fn timestamp(&self, row: usize) -> crate::Result<Nanos> {
        self.process
            .timestamp(row)
            .ok_or_else(|| ErrorKind::IndexOutOfBounds.into())
    }

    pub fn timestamps(&self) -> Vec<Nanos> {
        self.process.timestamps()
    }

    pub fn value(&self, row: usize, column: usize) -> crate::Result<CellValue> {
        let name = self.column_name(column)?;
        let (page, offset) = self
            .process
            .locate_row(row)
            .ok_or(ErrorKind::IndexOutOfBounds)?;
        Ok(self.process.blocks()[page]
            .column(name)
            .map(|values| values.cell(offset))
            .unwrap_or(CellValue::Null))
    }

    pub fn value_named(&self, row: usize, name: &str) -> crate::Result<CellValue> {
        let column = index_of(self.process.source_names(), name)?;
        self.value(row, column)
    }

    pub fn row_values(&self, row: usize) -> crate::Result<Vec<CellValue>> {
        let (page, offset) = self
            .process
            .locate_row(row)
            .ok_or(ErrorKind::IndexOutOfBounds)?;
        let block = &self.process.blocks()[page];
        Ok(self
            .process
            .source_names()
            .iter()
            .map(|name| {
                block
                    .column(name)
                    .map(|values| values.cell(offset))
                    .unwrap_or(CellValue::Null)
            })
            .collect())
    }

    pub fn column_data(&self, index: usize) -> crate::Result<Vec<CellValue>> {
        let name = self.column_name(index)?.to_string();
        Ok(self.cached_column(&name).as_ref().clone())
    }

    pub fn column_data_named(&self, name: &str) -> crate::Result<Vec<CellValue>> {
        let index = index_of(self.process.source_names(), name)?;
        self.column_data(index)
    }

    pub fn column_data_typed<T: ColumnElement>(
        &self,
        index: usize,
    ) -> crate::Result<Vec<Option<T>>> {
        check_assignable::<T>(self.column_type(index)?)?;
        let name = self.column_name(index)?.to_string();
        Ok(cells_to_typed(&self.cached_column(&name)))
    }

    pub fn column_data_typed_named<T: ColumnElement>(
        &self,
        name: &str,
    ) -> crate::Result<Vec<Option<T>>> {
        let index = index_of(self.process.source_names(), name)?;
        self.column_data_typed(index)
    }

    /// Materializes one source's full column (nulls where pages do not
    /// carry the source), memoizing the result.
    fn cached_column(&self, name: &str) -> Arc<Vec<CellValue>> {
        let mut cache = self.column_cache.lock().unwrap();
        if let Some(column) = cache.get(name) {
            return Arc::clone(column);
        }
        let mut cells = Vec::with_capacity(self.process.row_count());
        for block in self.process.blocks() {
            match block.column(name) {
                Some(values) => {
                    for i in 0..block.sample_count() {
                        cells.push(values.cell(i));
                    }
                }
                None => {
                    for _ in 0..block.sample_count() {
                        cells.push(CellValue::Null);
                    }
                }
            }
        }
        let column = Arc::new(cells);
        cache.insert(name.to_string(), Arc::clone(&column));
        column
    }

    pub fn allocation_size(&self) -> u64 {
        let cached: u64 = self
            .column_cache
            .lock()
            .unwrap()
            .values()
            .map(|column| column.iter().map(cell_allocation).sum::<u64>())
            .sum();
        self.process.byte_size() + self.process.row_offsets().len() as u64 * 8 + cached
    }
}
