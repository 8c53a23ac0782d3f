// content keys for dataset rows.
//
// a key is the hex sha-256 of the row's (column name, cell) pairs taken in
// column-name order, so it only depends on content: the row position, the
// source's column order and the process never enter the digest.

use sha2::{Digest, Sha256};

use crate::{dataset::Cell, CacheKey, DataFrame};

// separators between a column name and its cell, and between columns
const NAME_END: u8 = 0x1f;
const FIELD_END: u8 = 0x1e;

pub struct RowKeyer;

impl RowKeyer {
    // key of a single row; `columns` and `cells` are parallel
    pub fn key_row(columns: &[String], cells: &[Cell]) -> CacheKey {
        let mut order: Vec<usize> = (0..columns.len().min(cells.len())).collect();
        order.sort_by(|&a, &b| columns[a].cmp(&columns[b]));

        let mut hasher = Sha256::new();
        for idx in order {
            hasher.update(columns[idx].as_bytes());
            hasher.update([NAME_END]);
            encode_cell(&mut hasher, &cells[idx]);
            hasher.update([FIELD_END]);
        }
        CacheKey::new(hex::encode(hasher.finalize()))
    }

    // one key per row, in row order
    pub fn key_frame(df: &DataFrame) -> Vec<CacheKey> {
        df.rows()
            .iter()
            .map(|row| Self::key_row(df.columns(), row))
            .collect()
    }
}

fn encode_cell(hasher: &mut Sha256, cell: &Cell) {
    match cell {
        Cell::Missing => hasher.update([0u8]),
        Cell::Bool(v) => hasher.update([1u8, u8::from(*v)]),
        Cell::Int(v) => {
            hasher.update([2u8]);
            hasher.update(v.to_be_bytes());
        }
        Cell::Float(v) => {
            hasher.update([3u8]);
            hasher.update(canonical_bits(*v).to_be_bytes());
        }
        Cell::Text(v) => {
            hasher.update([4u8]);
            hasher.update((v.len() as u64).to_be_bytes());
            hasher.update(v.as_bytes());
        }
    }
}

// -0.0 and 0.0 compare equal, and all NaN payloads mean the same thing
fn canonical_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}
