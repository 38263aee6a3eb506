pub mod envfile;
pub mod partition;
