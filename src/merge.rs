use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::points::{PointDataset, Value};

/// Columns sampled for a set of dataset rows.
///
/// `row_ids[i]` is the dataset row that entry `i` of every column belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledColumns {
    pub row_ids: Vec<usize>,
    pub columns: Vec<(String, Vec<Option<f64>>)>,
}

impl SampledColumns {
    /// Columns covering rows `0..rows` in order.
    pub fn for_rows(rows: usize) -> Self {
        Self {
            row_ids: (0..rows).collect(),
            columns: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, values: Vec<Option<f64>>) {
        self.columns.push((name.into(), values));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}

/// Left-joins `sampled` into `dataset` on row identity.
///
/// Same-named columns are overwritten and rows with no sampled value get a
/// null, so merging the same columns twice leaves the dataset unchanged. The
/// whole join is checked before anything is written.
pub fn merge(dataset: &mut PointDataset, sampled: &SampledColumns) -> Result<()> {
    let rows = dataset.len();
    let mut seen = vec![false; rows];
    for &id in &sampled.row_ids {
        match seen.get_mut(id) {
            None => {
                return Err(Error::JoinIntegrity(format!(
                    "row id {id} is outside a dataset of {rows} rows"
                )));
            }
            Some(true) => {
                return Err(Error::JoinIntegrity(format!(
                    "row id {id} appears more than once"
                )));
            }
            Some(slot) => *slot = true,
        }
    }
    let mut names = HashSet::new();
    for (name, values) in &sampled.columns {
        if dataset.is_coordinate_field(name) {
            return Err(Error::JoinIntegrity(format!(
                "column {name:?} would overwrite a coordinate field"
            )));
        }
        if !names.insert(name.as_str()) {
            return Err(Error::JoinIntegrity(format!(
                "column {name:?} appears more than once"
            )));
        }
        if values.len() != sampled.row_ids.len() {
            return Err(Error::JoinIntegrity(format!(
                "column {name:?} has {} values for {} row ids",
                values.len(),
                sampled.row_ids.len()
            )));
        }
    }

    for (name, values) in &sampled.columns {
        let mut cells = vec![Value::Null; rows];
        for (&id, v) in sampled.row_ids.iter().zip(values) {
            cells[id] = Value::from(*v);
        }
        dataset.set_column(name, cells)?;
    }
    if dataset.len() != rows {
        return Err(Error::JoinIntegrity(format!(
            "row count changed from {rows} to {}",
            dataset.len()
        )));
    }
    debug!(columns = sampled.columns.len(), rows, "columns merged");
    Ok(())
}

/// [`merge`], then persist the dataset to `path`.
pub fn merge_and_save(
    dataset: &mut PointDataset,
    sampled: &SampledColumns,
    path: impl AsRef<Path>,
) -> Result<()> {
    merge(dataset, sampled)?;
    dataset.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> PointDataset {
        PointDataset::new(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)])
    }

    #[test]
    fn keeps_rows_without_values() {
        let mut ds = dataset();
        let sampled = SampledColumns {
            row_ids: vec![2, 0],
            columns: vec![("rain-21-03".into(), vec![Some(4.0), None])],
        };
        merge(&mut ds, &sampled).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(
            ds.column("rain-21-03").unwrap(),
            &[Value::Null, Value::Null, Value::Number(4.0)]
        );
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let mut ds = dataset();
        let mut sampled = SampledColumns::for_rows(3);
        sampled.push("tas-16-01", vec![Some(1.0), Some(2.0), Some(3.0)]);
        sampled.push("tas-16-02", vec![None, Some(5.0), Some(6.0)]);

        merge(&mut ds, &sampled).unwrap();
        let once = ds.clone();
        merge(&mut ds, &sampled).unwrap();
        assert_eq!(ds, once);
        assert_eq!(ds.column_names().count(), 4);
    }

    #[test]
    fn integrity_violations_leave_dataset_untouched() {
        let before = dataset();
        let mut ds = before.clone();

        let duplicate = SampledColumns {
            row_ids: vec![0, 0],
            columns: vec![("x".into(), vec![Some(1.0), Some(2.0)])],
        };
        let outside = SampledColumns {
            row_ids: vec![3],
            columns: vec![("x".into(), vec![Some(1.0)])],
        };
        let ragged = SampledColumns {
            row_ids: vec![0, 1],
            columns: vec![
                ("ok".into(), vec![Some(1.0), Some(2.0)]),
                ("x".into(), vec![Some(1.0)]),
            ],
        };
        let coordinate = SampledColumns {
            row_ids: vec![0, 1, 2],
            columns: vec![
                ("tas-16-01".into(), vec![Some(1.0), Some(2.0), Some(3.0)]),
                ("POINT_X".into(), vec![Some(9.0), Some(9.0), Some(9.0)]),
            ],
        };
        let repeated = SampledColumns {
            row_ids: vec![0, 1, 2],
            columns: vec![
                ("tas-16-01".into(), vec![Some(1.0), Some(2.0), Some(3.0)]),
                ("tas-16-01".into(), vec![None, None, None]),
            ],
        };
        for bad in [duplicate, outside, ragged, coordinate, repeated] {
            let err = merge(&mut ds, &bad).unwrap_err();
            assert!(matches!(err, Error::JoinIntegrity(_)), "{err}");
        }
        assert_eq!(ds, before);
    }

    #[test]
    fn merge_and_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut ds = dataset();
        let mut sampled = SampledColumns::for_rows(3);
        sampled.push("elev", vec![Some(10.0), None, Some(12.5)]);
        merge_and_save(&mut ds, &sampled, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "POINT_X,POINT_Y,elev\n0,0,10\n1,1,\n2,2,12.5\n");
    }
}
