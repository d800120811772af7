//! Controllers
//!
//! Este módulo contiene la lógica de cada grupo de rutas de la API.

pub mod caruso_controller;
pub mod high_mobility_controller;
pub mod job_controller;
pub mod vehicle_controller;
