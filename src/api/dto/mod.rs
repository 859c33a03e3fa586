//! Data Transfer Objects for the HTTP surface.

pub mod webhook_dto;

pub use webhook_dto::*;
