//! Telematics gateway
//!
//! Gateway HTTP sobre High Mobility y Caruso: registro de vehículos,
//! reconciliación de la vinculación y consulta periódica de datos.

pub mod cache;
pub mod clients;
pub mod config;
pub mod controllers;
pub mod database;
pub mod dto;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
