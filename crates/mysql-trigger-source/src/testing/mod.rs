//! Docker-managed MySQL for integration tests.

pub mod container;

pub use container::MySQLContainer;
