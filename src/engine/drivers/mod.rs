// Database Drivers Module
// Concrete QueryDriver implementations

#[cfg(feature = "postgres")]
pub mod postgres;
