//! 领域层

pub mod model;
pub mod repository;
pub mod service;
