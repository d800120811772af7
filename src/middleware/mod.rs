//! Middleware del sistema
//!
//! Este módulo contiene el middleware de autenticación y CORS.

pub mod auth;
pub mod cors;

pub use auth::{admin_auth_middleware, hm_auth_middleware, AdminCredentials};
pub use cors::cors_layer;
