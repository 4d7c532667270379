pub mod colormaps;
pub mod parameter_table;
pub mod plot;
