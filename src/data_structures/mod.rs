pub mod bbox;
pub mod morton;
pub mod surfel;
pub mod vector;
