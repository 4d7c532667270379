pub mod histogram1d;
pub mod statistics;
