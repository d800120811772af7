//! Cache
//!
//! Este módulo contiene la cache en memoria de access tokens.

pub mod token_cache;

pub use token_cache::{AccessToken, IssuedToken, TokenCache, TokenSource};
