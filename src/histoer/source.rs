use std::path::{Path, PathBuf};

use fnv::FnvHashMap;

use super::histo1d::histogram1d::Histogram;
use super::histo2d::histogram2d::Histogram2D;
use super::histo3d::histogram3d::Histogram3D;
use crate::error::CalibrationError;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum Distribution {
    Histogram(Histogram),
    Histogram2D(Histogram2D),
    Histogram3D(Histogram3D),
}

impl Distribution {
    pub fn name(&self) -> &str {
        match self {
            Distribution::Histogram(hist) => &hist.name,
            Distribution::Histogram2D(hist) => &hist.name,
            Distribution::Histogram3D(hist) => &hist.name,
        }
    }

    fn dimension(&self) -> usize {
        match self {
            Distribution::Histogram(_) => 1,
            Distribution::Histogram2D(_) => 2,
            Distribution::Histogram3D(_) => 3,
        }
    }

    fn check_shape(&self) -> Result<(), String> {
        match self {
            Distribution::Histogram(hist) => hist.check_shape(),
            Distribution::Histogram2D(hist) => hist.check_shape(),
            Distribution::Histogram3D(hist) => hist.check_shape(),
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize)]
struct HistogramFile {
    histograms: Vec<Distribution>,
}

/// Read-only set of named histograms produced upstream.
///
/// Files are JSON or YAML (chosen by extension) holding
/// `{"histograms": [{"Histogram3D": {...}}, ...]}`.
#[derive(Debug)]
pub struct HistogramSource {
    pub path: PathBuf,
    histograms: FnvHashMap<String, Distribution>,
}

impl HistogramSource {
    pub fn open(path: &Path) -> Result<Self, CalibrationError> {
        if !path.is_file() {
            return Err(CalibrationError::Config(format!(
                "histogram file {} does not exist",
                path.display()
            )));
        }
        let reader = std::io::BufReader::new(std::fs::File::open(path)?);
        let file: HistogramFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_reader(reader)?,
            _ => serde_json::from_reader(reader)?,
        };

        log::info!(
            "Loaded {} histogram(s) from {}",
            file.histograms.len(),
            path.display()
        );

        Self::from_distributions(path, file.histograms)
    }

    pub fn from_distributions(
        path: &Path,
        distributions: Vec<Distribution>,
    ) -> Result<Self, CalibrationError> {
        let mut histograms = FnvHashMap::default();
        for distribution in distributions {
            distribution
                .check_shape()
                .map_err(CalibrationError::HistogramShape)?;
            let name = distribution.name().to_owned();
            if histograms.insert(name.clone(), distribution).is_some() {
                log::warn!("Histogram \"{name}\" appears more than once; the last one is used");
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            histograms,
        })
    }

    pub fn save(path: &Path, distributions: &[Distribution]) -> Result<(), CalibrationError> {
        #[derive(serde::Serialize)]
        struct HistogramFileRef<'a> {
            histograms: &'a [Distribution],
        }

        let writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        let file = HistogramFileRef {
            histograms: distributions,
        };
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => serde_yaml::to_writer(writer, &file)?,
            _ => serde_json::to_writer(writer, &file)?,
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    fn get(&self, key: &str) -> Result<&Distribution, CalibrationError> {
        self.histograms
            .get(key)
            .ok_or_else(|| CalibrationError::MissingHistogram {
                key: key.to_owned(),
                source: self.path.clone(),
            })
    }

    fn wrong_dimension(&self, key: &str, found: &Distribution, expected: usize) -> CalibrationError {
        CalibrationError::HistogramShape(format!(
            "\"{key}\" in {} is {}D while a {expected}D histogram was expected",
            self.path.display(),
            found.dimension()
        ))
    }

    pub fn histogram(&self, key: &str) -> Result<&Histogram, CalibrationError> {
        match self.get(key)? {
            Distribution::Histogram(hist) => Ok(hist),
            other => Err(self.wrong_dimension(key, other, 1)),
        }
    }

    pub fn histogram2d(&self, key: &str) -> Result<&Histogram2D, CalibrationError> {
        match self.get(key)? {
            Distribution::Histogram2D(hist) => Ok(hist),
            other => Err(self.wrong_dimension(key, other, 2)),
        }
    }

    pub fn histogram3d(&self, key: &str) -> Result<&Histogram3D, CalibrationError> {
        match self.get(key)? {
            Distribution::Histogram3D(hist) => Ok(hist),
            other => Err(self.wrong_dimension(key, other, 3)),
        }
    }
}
