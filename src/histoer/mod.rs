pub mod axis;
pub mod histo1d;
pub mod histo2d;
pub mod histo3d;
pub mod projector;
pub mod source;
