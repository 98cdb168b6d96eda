pub mod assignment;
pub mod driver;
pub mod ids;
pub mod order;
pub mod principal;
pub mod restaurant;
pub mod tracking;
