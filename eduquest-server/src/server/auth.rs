use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use eduquest_shared::auth::Role;
use eduquest_shared::jwt::{self, JwtClaims};
use tracing::warn;

use super::{AppError, AppState};

/// How many days before mandatory re-login.
const TOKEN_TTL_DAYS: i64 = 30;

#[derive(Clone, Debug)]
pub struct AuthCtx {
    pub claims: JwtClaims,
}

pub async fn require_bearer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let unauthorized = || Err(AppError::unauthorized());
    let header_val = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return unauthorized(),
    };
    let header_str = header_val.to_str().map_err(|_| AppError::unauthorized())?;
    let prefix = "Bearer ";
    if !header_str.starts_with(prefix) {
        return unauthorized();
    }
    let token = &header_str[prefix.len()..];

    let claims = match jwt::decode_and_verify(token, state.config.jwt_secret.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error=%e, "auth: jwt decode failed");
            return unauthorized();
        }
    };

    validate_claims(&state, &claims).map_err(|e| {
        tracing::warn!(error=?e, username=%claims.sub, "auth: validate_claims failed");
        AppError::unauthorized()
    })?;

    let auth = AuthCtx { claims };
    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

/// Check a username/password pair against the config users. This is the
/// identity-provider credential check; finish-early and account deletion
/// re-authenticate through it.
pub fn verify_credentials(state: &AppState, username: &str, password: &str) -> bool {
    let Some(user) = state.config.user(username) else {
        warn!(username, "credentials: unknown username");
        return false;
    };
    match bcrypt::verify(password, &user.password_hash) {
        Ok(ok) => {
            if !ok {
                warn!(username, "credentials: invalid password");
            }
            ok
        }
        Err(e) => {
            tracing::error!(username, error=%e, "credentials: bcrypt verify failed");
            false
        }
    }
}

pub fn issue_jwt_for_user(
    state: &AppState,
    username: &str,
    role: Role,
    parent_id: Option<String>,
) -> Result<String, AppError> {
    let jti = uuid::Uuid::new_v4().to_string();
    let exp = (Utc::now() + Duration::days(TOKEN_TTL_DAYS)).timestamp();
    let claims = JwtClaims {
        sub: username.to_string(),
        jti,
        exp,
        role,
        parent_id,
    };

    validate_claims(state, &claims)?;

    let token = jwt::encode(&claims, state.config.jwt_secret.as_bytes()).map_err(|e| {
        tracing::error!(username, error=%e, "login: jwt encode failed");
        AppError::internal(e)
    })?;
    Ok(token)
}

fn validate_claims(state: &AppState, claims: &JwtClaims) -> Result<(), AppError> {
    let user = state.config.user(&claims.sub).ok_or_else(|| {
        warn!(username = %claims.sub, "issue_jwt: unknown user");
        AppError::forbidden()
    })?;

    if user.role != claims.role {
        warn!(
            username = %claims.sub,
            requested_role = ?claims.role,
            actual_role = ?user.role,
            "issue_jwt: role mismatch"
        );
        return Err(AppError::forbidden());
    }

    match claims.role {
        Role::Parent => {
            if claims.parent_id.is_some() {
                warn!(
                    username = %claims.sub,
                    "issue_jwt: parent token must not carry a parent pairing"
                );
                return Err(AppError::forbidden());
            }
        }
        Role::Child => {
            let paired = claims.parent_id.as_deref().ok_or_else(|| {
                warn!(username = %claims.sub, "issue_jwt: child token missing parent pairing");
                AppError::forbidden()
            })?;
            let expected = state.config.parent_of(&claims.sub).ok_or_else(|| {
                warn!(username = %claims.sub, "issue_jwt: child not configured");
                AppError::forbidden()
            })?;
            if expected != paired {
                warn!(
                    username = %claims.sub,
                    expected,
                    requested = paired,
                    "issue_jwt: parent pairing mismatch"
                );
                return Err(AppError::forbidden());
            }
        }
    }

    Ok(())
}
