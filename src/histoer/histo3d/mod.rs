pub mod histogram3d;
pub mod projections;
