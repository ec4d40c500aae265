pub mod controllers;
pub mod error;
pub mod filters;
pub mod models;
pub mod storage;
