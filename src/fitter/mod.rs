pub mod common;
pub mod levmar;
pub mod main_fitter;
pub mod models;
pub mod outlier_gate;
pub mod refiner;
pub mod uncertainty;
