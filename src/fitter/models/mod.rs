pub mod exponential;
pub mod gaussian;
pub mod linear;
pub mod polynomial;
pub mod powerlaw;
