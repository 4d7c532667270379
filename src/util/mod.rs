pub mod processer;
