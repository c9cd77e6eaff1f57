pub mod census;
pub mod counter;
pub mod driver;
pub mod pool;
pub mod server;
pub mod traffic;
