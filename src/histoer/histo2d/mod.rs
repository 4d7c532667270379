pub mod histogram2d;
pub mod projections;
