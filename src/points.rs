//! The point dataset being attributed: a CSV of survey points whose columns
//! grow as rasters are sampled into it.

use std::fmt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_X_FIELD: &str = "POINT_X";
pub const DEFAULT_Y_FIELD: &str = "POINT_Y";

/// A single attribute cell.
///
/// Cells read from disk stay [`Value::Text`] so that re-saving reproduces
/// them exactly; sampled values are [`Value::Number`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the cell; text is parsed, nulls and non-numbers give `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Number(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<Option<f64>> for Value {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Value::Null, Value::Number)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(v) => {
                // raster cells are f32: print the shortest form that reads back the same
                let narrow = *v as f32;
                if f64::from(narrow) == *v {
                    write!(f, "{narrow}")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    values: Vec<Value>,
}

/// Ordered point records with a fixed geometry and an open set of attributes.
///
/// A row's identity is its index. Nothing in this type adds or removes rows
/// after construction; columns can be added or overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct PointDataset {
    points: Vec<(f64, f64)>,
    columns: Vec<Column>,
    x_field: String,
    y_field: String,
}

impl PointDataset {
    /// An in-memory dataset holding only the coordinate columns.
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        let xs = points.iter().map(|p| Value::Number(p.0)).collect();
        let ys = points.iter().map(|p| Value::Number(p.1)).collect();
        Self {
            points,
            columns: vec![
                Column {
                    name: DEFAULT_X_FIELD.to_string(),
                    values: xs,
                },
                Column {
                    name: DEFAULT_Y_FIELD.to_string(),
                    values: ys,
                },
            ],
            x_field: DEFAULT_X_FIELD.to_string(),
            y_field: DEFAULT_Y_FIELD.to_string(),
        }
    }

    /// Loads a CSV whose coordinates are in `POINT_X` / `POINT_Y`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_fields(path, DEFAULT_X_FIELD, DEFAULT_Y_FIELD)
    }

    pub fn load_with_fields(path: impl AsRef<Path>, x_field: &str, y_field: &str) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| Error::Dataset(format!("{}: {e}", path.display())))?;

        let mut columns: Vec<Column> = reader
            .headers()?
            .iter()
            .map(|name| Column {
                name: name.to_string(),
                values: Vec::new(),
            })
            .collect();

        for record in reader.records() {
            let record = record?;
            for (column, cell) in columns.iter_mut().zip(record.iter()) {
                column.values.push(if cell.is_empty() {
                    Value::Null
                } else {
                    Value::Text(cell.to_string())
                });
            }
        }

        let find = |name: &str| {
            columns
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::Dataset(format!("{}: no {name:?} column", path.display())))
        };
        let xs = find(x_field)?;
        let ys = find(y_field)?;
        let points = xs
            .values
            .iter()
            .zip(&ys.values)
            .enumerate()
            .map(|(row, (x, y))| match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok((x, y)),
                _ => Err(Error::Dataset(format!(
                    "{}: row {row} has no numeric coordinates",
                    path.display()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(path = %path.display(), rows = points.len(), columns = columns.len(), "point dataset loaded");
        Ok(Self {
            points,
            columns,
            x_field: x_field.to_string(),
            y_field: y_field.to_string(),
        })
    }

    /// Writes the dataset as CSV, replacing `path` only once the write has completed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::Writer::from_writer(&mut tmp);
            writer.write_record(self.columns.iter().map(|c| c.name.as_str()))?;
            for row in 0..self.len() {
                writer.write_record(self.columns.iter().map(|c| c.values[row].to_string()))?;
            }
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!(path = %path.display(), rows = self.len(), "point dataset saved");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Coordinates in row order, in the dataset's own CRS.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// True for the two columns the geometry is read from.
    pub fn is_coordinate_field(&self, name: &str) -> bool {
        name == self.x_field || name == self.y_field
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        self.column(name).and_then(|values| values.get(row))
    }

    /// Replaces the column called `name`, or appends it after the existing ones.
    ///
    /// `values` must hold exactly one cell per row.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::JoinIntegrity(format!(
                "column {name:?} has {} values for {} rows",
                values.len(),
                self.len()
            )));
        }
        if self.is_coordinate_field(name) {
            return Err(Error::Dataset(format!(
                "coordinate column {name:?} cannot be overwritten"
            )));
        }
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(column) => column.values = values,
            None => self.columns.push(Column {
                name: name.to_string(),
                values,
            }),
        }
        Ok(())
    }

    /// Names of the columns containing `fragment`, preceded by `extra`.
    ///
    /// Used to pull one variable's series (every `rain-*` column, say)
    /// together with identifying columns.
    pub fn series_columns(&self, fragment: &str, extra: &[&str]) -> Vec<String> {
        extra
            .iter()
            .filter(|name| self.has_column(name))
            .map(|name| name.to_string())
            .chain(
                self.columns
                    .iter()
                    .filter(|c| c.name.contains(fragment) && !extra.contains(&c.name.as_str()))
                    .map(|c| c.name.clone()),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CSV: &str = "id,POINT_X,POINT_Y,site\n1,400000.5,300000,North Field\n2,401000,301000,\n";

    #[test]
    fn load_and_save_keeps_cells_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("points.csv");
        fs::write(&src, CSV).unwrap();

        let ds = PointDataset::load(&src).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.points(), &[(400000.5, 300000.0), (401000.0, 301000.0)]);
        assert_eq!(ds.value(0, "site"), Some(&Value::Text("North Field".into())));
        assert!(ds.value(1, "site").unwrap().is_null());

        let out = dir.path().join("out.csv");
        ds.save(&out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), CSV);
    }

    #[test]
    fn single_precision_cells_print_short() {
        assert_eq!(Value::Number(f64::from(12.3f32)).to_string(), "12.3");
        assert_eq!(Value::Number(f64::from(-0.1f32)).to_string(), "-0.1");
        assert_eq!(Value::Number(0.1).to_string(), "0.1");
        assert_eq!(Value::Number(400000.5).to_string(), "400000.5");
        assert_eq!(Value::Number(1.0 / 3.0).to_string(), "0.3333333333333333");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn custom_coordinate_fields() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pts.csv");
        fs::write(&src, "E,N\n1,2\n").unwrap();
        assert!(PointDataset::load(&src).is_err());
        let ds = PointDataset::load_with_fields(&src, "E", "N").unwrap();
        assert_eq!(ds.points(), &[(1.0, 2.0)]);
    }

    #[test]
    fn non_numeric_coordinates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pts.csv");
        fs::write(&src, "POINT_X,POINT_Y\n1,2\nx,3\n").unwrap();
        let err = PointDataset::load(&src).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn set_column_replaces_or_appends() {
        let mut ds = PointDataset::new(vec![(0.0, 0.0), (1.0, 1.0)]);
        ds.set_column("tas-16-01", vec![Value::Number(1.5), Value::Null])
            .unwrap();
        ds.set_column("tas-16-01", vec![Value::Number(2.5), Value::Number(3.0)])
            .unwrap();
        assert_eq!(
            ds.column_names().collect::<Vec<_>>(),
            vec!["POINT_X", "POINT_Y", "tas-16-01"]
        );
        assert_eq!(ds.value(0, "tas-16-01"), Some(&Value::Number(2.5)));

        let err = ds.set_column("short", vec![Value::Null]).unwrap_err();
        assert!(matches!(err, Error::JoinIntegrity(_)));
        assert!(ds.set_column("POINT_X", vec![Value::Null; 2]).is_err());
    }

    #[test]
    fn series_columns_selects_by_fragment() {
        let mut ds = PointDataset::new(vec![(0.0, 0.0)]);
        for name in ["rain-21-01", "tas-21-01", "rain-21-02"] {
            ds.set_column(name, vec![Value::Null]).unwrap();
        }
        assert_eq!(
            ds.series_columns("rain", &["POINT_X", "missing"]),
            vec!["POINT_X", "rain-21-01", "rain-21-02"]
        );
    }
}
