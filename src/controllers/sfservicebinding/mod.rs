pub mod controller;
mod provisioner;

pub use controller::run;
