//! DTOs de la API

pub mod caruso_dto;
pub mod clearance_dto;
pub mod vehicle_dto;
