//! Row access and multi-type mapping
//!
//! Whole rows map through `sqlx::FromRow`. Joined rows are cut into
//! column segments at the split column, and each segment maps through
//! [`FromRecord`] into its own type.

use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Column, Decode, FromRow, Row, Type};
use std::fmt;
use std::ops::Range;

use crate::error::{DataError, Result};

// =============================================================================
// Record
// =============================================================================

/// One row produced by a row cursor
pub struct Record {
    row: SqliteRow,
}

impl Record {
    pub(crate) fn new(row: SqliteRow) -> Self {
        Self { row }
    }

    /// Column names, in result order
    pub fn columns(&self) -> Vec<&str> {
        self.row.columns().iter().map(|column| column.name()).collect()
    }

    /// Decode a column by name (case-insensitive)
    pub fn get<T>(&self, column: &str) -> Result<T>
    where
        T: for<'r> Decode<'r, Sqlite> + Type<Sqlite>,
    {
        self.view().get(column)
    }

    /// Map the whole row through `sqlx::FromRow`
    pub fn map<T>(&self) -> Result<T>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        Ok(T::from_row(&self.row)?)
    }

    /// View over every column of the row
    pub fn view(&self) -> RecordView<'_> {
        RecordView::new(&self.row, 0..self.row.len())
    }
}

// =============================================================================
// RecordView
// =============================================================================

/// A contiguous range of columns within a row
#[derive(Clone)]
pub struct RecordView<'r> {
    row: &'r SqliteRow,
    range: Range<usize>,
}

impl<'r> RecordView<'r> {
    pub(crate) fn new(row: &'r SqliteRow, range: Range<usize>) -> Self {
        Self { row, range }
    }

    /// Number of columns in this view
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Column names in this view
    pub fn columns(&self) -> Vec<&'r str> {
        self.row.columns()[self.range.clone()]
            .iter()
            .map(|column| column.name())
            .collect()
    }

    /// Decode a column of this view by name (case-insensitive)
    ///
    /// # Errors
    /// `Mapping` if the column is not part of the view or fails to decode
    pub fn get<T>(&self, column: &str) -> Result<T>
    where
        T: for<'a> Decode<'a, Sqlite> + Type<Sqlite>,
    {
        let index = self.index_of(column).ok_or_else(|| {
            DataError::Mapping(format!(
                "column '{}' not found in columns {:?}",
                column,
                self.columns()
            ))
        })?;

        Ok(self.row.try_get::<T, usize>(index)?)
    }

    /// Decode a column of this view by position relative to the view
    pub fn get_at<T>(&self, position: usize) -> Result<T>
    where
        T: for<'a> Decode<'a, Sqlite> + Type<Sqlite>,
    {
        if position >= self.range.len() {
            return Err(DataError::Mapping(format!(
                "column position {} out of bounds for {} columns",
                position,
                self.range.len()
            )));
        }

        Ok(self.row.try_get::<T, usize>(self.range.start + position)?)
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.range.clone().find(|&index| {
            self.row.columns()[index]
                .name()
                .eq_ignore_ascii_case(column)
        })
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("columns", &self.columns())
            .finish()
    }
}

impl fmt::Debug for RecordView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordView")
            .field("range", &self.range)
            .field("columns", &self.columns())
            .finish()
    }
}

// =============================================================================
// Mapping traits
// =============================================================================

/// Map a column segment to a value
///
/// # Example
/// ```ignore
/// impl FromRecord for Customer {
///     fn from_record(record: &RecordView<'_>) -> Result<Self> {
///         Ok(Self {
///             id: record.get("id")?,
///             name: record.get("name")?,
///         })
///     }
/// }
/// ```
pub trait FromRecord: Sized {
    fn from_record(record: &RecordView<'_>) -> Result<Self>;
}

/// A tuple of 2 to 4 [`FromRecord`] types read side by side from one row
pub trait SplitRow: Sized {
    /// Number of types (and column segments) in the tuple
    const ARITY: usize;

    fn from_segments(row: &SqliteRow, segments: &[Range<usize>]) -> Result<Self>;
}

macro_rules! impl_split_row {
    ($arity:expr; $($ty:ident => $index:tt),+) => {
        impl<$($ty: FromRecord),+> SplitRow for ($($ty,)+) {
            const ARITY: usize = $arity;

            fn from_segments(row: &SqliteRow, segments: &[Range<usize>]) -> Result<Self> {
                Ok(($(
                    $ty::from_record(&RecordView::new(row, segments[$index].clone()))?,
                )+))
            }
        }
    };
}

impl_split_row!(2; A => 0, B => 1);
impl_split_row!(3; A => 0, B => 1, C => 2);
impl_split_row!(4; A => 0, B => 1, C => 2, D => 3);

/// Cut `columns` into `arity` segments at the split column.
///
/// Boundaries are searched from the last column backwards: the last type
/// starts at the right-most `split_on` column, the type before it at the
/// right-most `split_on` column left of that, and so on. The first type
/// always starts at column 0.
pub(crate) fn split_segments<'c>(
    columns: impl Iterator<Item = &'c str>,
    split_on: &str,
    arity: usize,
) -> Result<Vec<Range<usize>>> {
    let names: Vec<&str> = columns.collect();
    let mut end = names.len();
    let mut starts = Vec::with_capacity(arity);

    for _ in 1..arity {
        let start = (1..end)
            .rev()
            .find(|&index| names[index].eq_ignore_ascii_case(split_on))
            .ok_or_else(|| {
                DataError::Mapping(format!(
                    "split column '{}' not found for {} types in columns {:?}",
                    split_on, arity, names
                ))
            })?;
        starts.push(start);
        end = start;
    }
    starts.push(0);
    starts.reverse();

    let segments = starts
        .iter()
        .enumerate()
        .map(|(position, &start)| {
            let end = starts.get(position + 1).copied().unwrap_or(names.len());
            start..end
        })
        .collect();

    Ok(segments)
}

/// Segments for a concrete row
pub(crate) fn row_segments(
    row: &SqliteRow,
    split_on: &str,
    arity: usize,
) -> Result<Vec<Range<usize>>> {
    split_segments(
        row.columns().iter().map(|column| column.name()),
        split_on,
        arity,
    )
}
