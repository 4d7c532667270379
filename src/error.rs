use std::error::Error;
use std::fmt::Display;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CalibrationError {
    File(std::io::Error),
    Yaml(serde_yaml::Error),
    Json(serde_json::Error),
    Config(String),
    Status { expected: String, found: String },
    MissingHistogram { key: String, source: PathBuf },
    HistogramShape(String),
    NoAcceptedPoints { combination: String },
    Table { path: PathBuf, reason: String },
    Plot(image::ImageError),
    ThreadPool(rayon::ThreadPoolBuildError),
    UnitsFailed(Vec<String>),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> CalibrationError {
        CalibrationError::File(err)
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> CalibrationError {
        CalibrationError::Yaml(err)
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> CalibrationError {
        CalibrationError::Json(err)
    }
}

impl From<image::ImageError> for CalibrationError {
    fn from(err: image::ImageError) -> CalibrationError {
        CalibrationError::Plot(err)
    }
}

impl From<rayon::ThreadPoolBuildError> for CalibrationError {
    fn from(value: rayon::ThreadPoolBuildError) -> Self {
        CalibrationError::ThreadPool(value)
    }
}

impl Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationError::File(x) => write!(f, "Calibration had a file I/O error: {x}"),
            CalibrationError::Yaml(x) => write!(f, "Calibration could not parse YAML input: {x}"),
            CalibrationError::Json(x) => write!(f, "Calibration could not parse JSON input: {x}"),
            CalibrationError::Config(x) => write!(f, "Invalid configuration: {x}"),
            CalibrationError::Status { expected, found } => write!(
                f,
                "Input file has status \"{found}\" while \"{expected}\" was expected"
            ),
            CalibrationError::MissingHistogram { key, source } => write!(
                f,
                "Histogram named \"{key}\" does not exist in file {}",
                source.display()
            ),
            CalibrationError::HistogramShape(x) => write!(f, "Histogram has a bad shape: {x}"),
            CalibrationError::NoAcceptedPoints { combination } => write!(
                f,
                "No fit was accepted for {combination}; the calibration curve cannot be built"
            ),
            CalibrationError::Table { path, reason } => {
                write!(f, "Parameter table {} cannot be used: {reason}", path.display())
            }
            CalibrationError::Plot(x) => write!(f, "Calibration could not write a plot: {x}"),
            CalibrationError::ThreadPool(x) => {
                write!(f, "Calibration could not start the worker pool: {x}")
            }
            CalibrationError::UnitsFailed(units) => {
                write!(f, "{} calibration unit(s) failed:", units.len())?;
                for unit in units {
                    write!(f, "\n  {unit}")?;
                }
                Ok(())
            }
        }
    }
}

impl Error for CalibrationError {}
