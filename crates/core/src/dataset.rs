// typed tabular data: cells, frames and datasets with their column schema.
//
// column dtypes use pandas-style names ("int64", "float64", "bool", "object",
// "category", ...) because that is what callers send on the wire.

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::DatasetError, ColumnType, DatasetId};

pub const DATASET_META_FILE: &str = "dataset-meta.json";
pub const DATASET_DATA_FILE: &str = "data.csv";

// wire markers that mean "no value"
const MISSING_MARKERS: [&str; 5] = ["", "nan", "NaN", "None", "null"];

// a single typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            Cell::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Cell::Missing | Cell::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(v) => Some(v),
            _ => None,
        }
    }

    // parse a raw string into the representation of `dtype`
    pub fn parse(raw: &str, dtype: &str) -> Option<Cell> {
        let trimmed = raw.trim();
        let kind = DtypeKind::of(dtype);
        if kind != DtypeKind::Text && MISSING_MARKERS.contains(&trimmed) {
            return Some(Cell::Missing);
        }
        match kind {
            DtypeKind::Int => trimmed
                .parse::<i64>()
                .ok()
                .map(Cell::Int)
                .or_else(|| integral(trimmed.parse::<f64>().ok()?).map(Cell::Int)),
            DtypeKind::Float => trimmed.parse::<f64>().ok().map(Cell::Float),
            DtypeKind::Bool => match trimmed {
                "true" | "True" | "TRUE" | "1" => Some(Cell::Bool(true)),
                "false" | "False" | "FALSE" | "0" => Some(Cell::Bool(false)),
                _ => None,
            },
            DtypeKind::Text => Some(if raw.is_empty() {
                Cell::Missing
            } else {
                Cell::Text(raw.to_string())
            }),
        }
    }

    // convert an already-typed cell to `dtype`
    pub fn cast(&self, dtype: &str) -> Option<Cell> {
        match (self, DtypeKind::of(dtype)) {
            (Cell::Missing, _) => Some(Cell::Missing),
            (Cell::Text(raw), _) => Cell::parse(raw, dtype),
            (cell, DtypeKind::Text) => Some(Cell::Text(cell.to_string())),
            (Cell::Int(v), DtypeKind::Int) => Some(Cell::Int(*v)),
            (Cell::Int(v), DtypeKind::Float) => Some(Cell::Float(*v as f64)),
            (Cell::Int(v), DtypeKind::Bool) => Some(Cell::Bool(*v != 0)),
            (Cell::Float(v), DtypeKind::Float) => Some(Cell::Float(*v)),
            (Cell::Float(v), DtypeKind::Int) => {
                if v.is_nan() {
                    Some(Cell::Missing)
                } else {
                    integral(*v).map(Cell::Int)
                }
            }
            (Cell::Float(v), DtypeKind::Bool) => Some(Cell::Bool(*v != 0.0)),
            (Cell::Bool(v), DtypeKind::Bool) => Some(Cell::Bool(*v)),
            (Cell::Bool(v), DtypeKind::Int) => Some(Cell::Int(i64::from(*v))),
            (Cell::Bool(v), DtypeKind::Float) => Some(Cell::Float(if *v { 1.0 } else { 0.0 })),
        }
    }
}

fn integral(v: f64) -> Option<i64> {
    if v.fract() == 0.0 && v.is_finite() {
        Some(v as i64)
    } else {
        None
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Missing => Ok(()),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DtypeKind {
    Int,
    Float,
    Bool,
    Text,
}

impl DtypeKind {
    fn of(dtype: &str) -> Self {
        let lower = dtype.to_ascii_lowercase();
        if lower.starts_with("int") || lower.starts_with("uint") {
            DtypeKind::Int
        } else if lower.starts_with("float") {
            DtypeKind::Float
        } else if lower == "bool" || lower == "boolean" {
            DtypeKind::Bool
        } else {
            DtypeKind::Text
        }
    }
}

// ============================================================================
// DataFrame
// ============================================================================

// ordered columns and row-major cells
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataFrame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl DataFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, DatasetError> {
        let mut df = Self::new(columns);
        for row in rows {
            df.push_row(row)?;
        }
        Ok(df)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), DatasetError> {
        if row.len() != self.columns.len() {
            return Err(DatasetError::RowWidth {
                row: self.rows.len(),
                actual: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[Cell]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn column(&self, name: &str) -> Result<Vec<&Cell>, DatasetError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| DatasetError::UnknownColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    pub fn set_value(&mut self, row: usize, column: &str, cell: Cell) -> Result<(), DatasetError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| DatasetError::UnknownColumn(column.to_string()))?;
        if let Some(r) = self.rows.get_mut(row) {
            r[idx] = cell;
        }
        Ok(())
    }

    // rows at `indices`, in that order
    pub fn take(&self, indices: &[usize]) -> DataFrame {
        DataFrame {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        }
    }

    pub fn filter(&self, mask: &[bool]) -> DataFrame {
        DataFrame {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(row, _)| row.clone())
                .collect(),
        }
    }

    pub fn drop_column(&mut self, name: &str) -> bool {
        match self.column_index(name) {
            Some(idx) => {
                self.columns.remove(idx);
                for row in &mut self.rows {
                    row.remove(idx);
                }
                true
            }
            None => false,
        }
    }

    pub fn add_column(&mut self, name: impl Into<String>, fill: Cell) {
        self.columns.push(name.into());
        for row in &mut self.rows {
            row.push(fill.clone());
        }
    }

    // project onto `names`, in that order
    pub fn select(&self, names: &[String]) -> Result<DataFrame, DatasetError> {
        let indices = names
            .iter()
            .map(|n| {
                self.column_index(n)
                    .ok_or_else(|| DatasetError::UnknownColumn(n.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DataFrame {
            columns: names.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }

    // cast every column that has a declared dtype
    pub fn cast(&self, dtypes: &BTreeMap<String, String>) -> Result<DataFrame, DatasetError> {
        let mut out = self.clone();
        for (col_idx, column) in self.columns.iter().enumerate() {
            let Some(dtype) = dtypes.get(column) else {
                continue;
            };
            for row in &mut out.rows {
                let cell = &row[col_idx];
                row[col_idx] = cell.cast(dtype).ok_or_else(|| DatasetError::Cast {
                    column: column.clone(),
                    value: cell.to_string(),
                    dtype: dtype.clone(),
                })?;
            }
        }
        Ok(out)
    }

    // build a frame from string-valued rows, as received on the wire
    pub fn from_string_rows(
        rows: &[BTreeMap<String, String>],
        dtypes: &BTreeMap<String, String>,
    ) -> Result<DataFrame, DatasetError> {
        let mut columns: Vec<String> = dtypes.keys().cloned().collect();
        for row in rows {
            for name in row.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let mut df = DataFrame::new(columns.clone());
        for row in rows {
            let cells = columns
                .iter()
                .map(|column| match row.get(column) {
                    None => Ok(Cell::Missing),
                    Some(raw) => parse_cell(column, raw, dtypes),
                })
                .collect::<Result<Vec<_>, _>>()?;
            df.push_row(cells)?;
        }
        Ok(df)
    }

    pub fn read_csv(
        path: &Path,
        dtypes: &BTreeMap<String, String>,
    ) -> Result<DataFrame, DatasetError> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut df = DataFrame::new(columns.clone());
        for record in reader.records() {
            let record = record?;
            let cells = columns
                .iter()
                .zip(record.iter())
                .map(|(column, raw)| parse_cell(column, raw, dtypes))
                .collect::<Result<Vec<_>, _>>()?;
            df.push_row(cells)?;
        }
        Ok(df)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), DatasetError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|c| c.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_cell(
    column: &str,
    raw: &str,
    dtypes: &BTreeMap<String, String>,
) -> Result<Cell, DatasetError> {
    let dtype = dtypes.get(column).map(String::as_str).unwrap_or("object");
    Cell::parse(raw, dtype).ok_or_else(|| DatasetError::Cast {
        column: column.to_string(),
        value: raw.to_string(),
        dtype: dtype.to_string(),
    })
}

// ============================================================================
// Dataset
// ============================================================================

// metadata persisted next to a dataset's data file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatasetMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub column_dtypes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: Option<String>,
    pub df: DataFrame,
    pub target: Option<String>,
    pub column_types: BTreeMap<String, ColumnType>,
    pub column_dtypes: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(df: DataFrame) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            df,
            target: None,
            column_types: BTreeMap::new(),
            column_dtypes: BTreeMap::new(),
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_column_types(mut self, column_types: BTreeMap<String, ColumnType>) -> Self {
        self.column_types = column_types;
        self
    }

    pub fn with_column_dtypes(mut self, column_dtypes: BTreeMap<String, String>) -> Self {
        self.column_dtypes = column_dtypes;
        self
    }

    // rows sent by a caller, cast with the declared dtypes
    pub fn from_string_rows(
        rows: &[BTreeMap<String, String>],
        target: Option<String>,
        column_types: BTreeMap<String, ColumnType>,
        column_dtypes: BTreeMap<String, String>,
    ) -> Result<Self, DatasetError> {
        let df = DataFrame::from_string_rows(rows, &column_dtypes)?;
        Ok(Self::new(df)
            .with_target(target)
            .with_column_types(column_types)
            .with_column_dtypes(column_dtypes))
    }

    pub fn len(&self) -> usize {
        self.df.len()
    }

    pub fn is_empty(&self) -> bool {
        self.df.is_empty()
    }

    // same schema and identity over another frame
    pub fn with_frame(&self, df: DataFrame) -> Dataset {
        Dataset {
            id: self.id,
            name: self.name.clone(),
            df,
            target: self.target.clone(),
            column_types: self.column_types.clone(),
            column_dtypes: self.column_dtypes.clone(),
        }
    }

    pub fn slice(&self, indices: &[usize]) -> Dataset {
        self.with_frame(self.df.take(indices))
    }

    // columns a model would see: everything but the target
    pub fn feature_columns(&self) -> Vec<String> {
        self.df
            .columns()
            .iter()
            .filter(|c| Some(c.as_str()) != self.target.as_deref())
            .cloned()
            .collect()
    }

    pub fn meta(&self) -> DatasetMeta {
        DatasetMeta {
            name: self.name.clone(),
            target: self.target.clone(),
            column_types: self.column_types.clone(),
            column_dtypes: self.column_dtypes.clone(),
        }
    }

    // load `dataset-meta.json` + `data.csv` from an artifact directory
    pub fn load(dir: &Path) -> Result<Dataset, DatasetError> {
        let meta_raw = fs::read_to_string(dir.join(DATASET_META_FILE))?;
        let meta: DatasetMeta =
            serde_json::from_str(&meta_raw).map_err(|e| DatasetError::Meta(e.to_string()))?;
        let df = DataFrame::read_csv(&dir.join(DATASET_DATA_FILE), &meta.column_dtypes)?;

        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Uuid::parse_str(n).ok())
            .unwrap_or_else(Uuid::new_v4);

        Ok(Dataset {
            id,
            name: meta.name,
            df,
            target: meta.target,
            column_types: meta.column_types,
            column_dtypes: meta.column_dtypes,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<(), DatasetError> {
        fs::create_dir_all(dir)?;
        let meta =
            serde_json::to_string_pretty(&self.meta()).map_err(|e| DatasetError::Meta(e.to_string()))?;
        fs::write(dir.join(DATASET_META_FILE), meta)?;
        self.df.write_csv(&dir.join(DATASET_DATA_FILE))
    }
}
