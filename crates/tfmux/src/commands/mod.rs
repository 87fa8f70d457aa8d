pub mod serve;
pub mod signals;
