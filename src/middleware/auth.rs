//! Middleware de autenticación
//!
//! Dos esquemas:
//! - rutas High Mobility: Basic con la credencial admin (el gateway usa su
//!   propio token) o un Bearer de High Mobility que se reenvía tal cual;
//! - rutas admin: solo Basic con la credencial admin.
//!
//! El esquema elegido se inyecta en las extensions como `HmAuth`.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clients::HmAuth;
use crate::utils::errors::{AppError, FORBIDDEN_MESSAGE};

pub const HM_AUTH_REQUIRED_MESSAGE: &str = "No permission, either send the admin login using basic \
     auth or send the High Mobility access token yourself (in headers)";

/// Credencial admin; el password se guarda como hash bcrypt
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password_hash: String,
}

impl AdminCredentials {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
        }
    }

    /// Verificar un header `Basic base64(user:password)`
    ///
    /// bcrypt corre en el pool bloqueante de tokio, fuera del executor.
    pub async fn verify_basic(&self, encoded: &str) -> bool {
        let Some((username, password)) = decode_basic(encoded) else {
            return false;
        };
        if username != self.username {
            return false;
        }

        let hash = self.password_hash.clone();
        match tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash)).await {
            Ok(Ok(valid)) => valid,
            Ok(Err(e)) => {
                warn!("⚠️ Hash bcrypt de admin inválido: {}", e);
                false
            }
            Err(e) => {
                warn!("⚠️ Verificación bcrypt abortada: {}", e);
                false
            }
        }
    }
}

fn decode_basic(encoded: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Credencial presentada en `Authorization`
///
/// Se copia fuera del request: la verificación bcrypt hace await y el
/// request no puede quedar prestado a través de él.
enum Presented {
    Basic(String),
    Bearer(String),
    Missing,
}

fn presented(request: &Request) -> Presented {
    let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Presented::Missing;
    };

    if let Some(encoded) = value.strip_prefix("Basic ") {
        Presented::Basic(encoded.to_string())
    } else if let Some(token) = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        Presented::Bearer(token.to_string())
    } else {
        Presented::Missing
    }
}

/// Middleware de las rutas High Mobility
pub async fn hm_auth_middleware(
    State(admin): State<Arc<AdminCredentials>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let credential = presented(&request);
    let auth = match credential {
        Presented::Basic(encoded) if admin.verify_basic(&encoded).await => {
            debug!("🔑 Admin autenticado, se usa el token gestionado de High Mobility");
            HmAuth::Managed
        }
        Presented::Bearer(token) => HmAuth::Bearer(SecretString::from(token)),
        _ => return Err(AppError::Forbidden(HM_AUTH_REQUIRED_MESSAGE.to_string())),
    };

    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

/// Middleware de las rutas admin
pub async fn admin_auth_middleware(
    State(admin): State<Arc<AdminCredentials>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let credential = presented(&request);
    match credential {
        Presented::Basic(encoded) if admin.verify_basic(&encoded).await => {
            Ok(next.run(request).await)
        }
        _ => Err(AppError::Forbidden(FORBIDDEN_MESSAGE.to_string())),
    }
}
