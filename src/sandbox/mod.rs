pub mod client;
pub mod e2b;
pub mod simulator;
