use std::fmt::Display;
use std::path::Path;

use crate::error::CalibrationError;

/// Plain-text table read by the correction stage: one header line, then one
/// row of whitespace-separated values per calibrated unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTable {
    header: String,
    rows: Vec<String>,
}

impl ParameterTable {
    pub fn new(header: impl Display) -> Self {
        Self {
            header: header.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn push_values(&mut self, values: &[f64]) {
        self.rows.push(join(values.iter()));
    }

    /// Row of leading labels (run number, status flag, ...) followed by values.
    pub fn push_row<L: Display>(&mut self, labels: &[L], values: &[f64]) {
        let mut row = join(labels.iter());
        if !values.is_empty() {
            if !row.is_empty() {
                row.push(' ');
            }
            row.push_str(&join(values.iter()));
        }
        self.rows.push(row);
    }

    /// Reads a table written by [`ParameterTable::write`]. Every field of the
    /// header and of the rows must be a number.
    pub fn read(path: &Path) -> Result<Self, CalibrationError> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let header = lines.next().ok_or_else(|| CalibrationError::Table {
            path: path.to_path_buf(),
            reason: "the file is empty".to_owned(),
        })?;

        let table = Self {
            header: header.to_owned(),
            rows: lines.map(str::to_owned).collect(),
        };
        for (number, line) in std::iter::once(&table.header).chain(&table.rows).enumerate() {
            if let Some(field) = line.split_whitespace().find(|field| field.parse::<f64>().is_err()) {
                return Err(CalibrationError::Table {
                    path: path.to_path_buf(),
                    reason: format!("line {} holds \"{field}\", which is not a number", number + 1),
                });
            }
        }
        Ok(table)
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn header_values(&self) -> Vec<f64> {
        numbers(&self.header)
    }

    pub fn values(&self, row: usize) -> Option<Vec<f64>> {
        self.rows.get(row).map(|row| numbers(row))
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write(&self, path: &Path) -> Result<(), CalibrationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_string())?;
        log::info!("Wrote {} row(s) to {}", self.rows.len(), path.display());
        Ok(())
    }
}

fn numbers(line: &str) -> Vec<f64> {
    line.split_whitespace().filter_map(|field| field.parse().ok()).collect()
}

fn join<T: Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|item| item.to_string()).collect::<Vec<_>>().join(" ")
}

impl Display for ParameterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.header)?;
        for row in &self.rows {
            writeln!(f, "{row}")?;
        }
        Ok(())
    }
}
