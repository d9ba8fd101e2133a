use super::{AppError, auth::AuthCtx};
use axum::response::Response;
use axum::{
    extract::OriginalUri,
    http::{Method, Request},
    middleware::Next,
};
use eduquest_shared::auth::Role;
use eduquest_shared::jwt::JwtClaims;
use percent_encoding::percent_decode_str;

/// Role-level gate over the private API. Parent/child route access is decided
/// here from path shape alone; which records a principal may actually touch
/// is enforced below this layer by ownership-scoped queries.
pub async fn enforce_acl(
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|orig| orig.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().clone();
    let Some(auth) = req.extensions().get::<AuthCtx>() else {
        return Err(AppError::unauthorized());
    };
    let claims = &auth.claims;

    let segs = segmented(&path);
    if !segs.as_slice().starts_with(&["api"]) {
        tracing::warn!(?segs, "ACL: path outside api scope");
        return Err(AppError::forbidden());
    }
    let rest = &segs[1..];

    let decision = match claims.role {
        Role::Parent => allow_parent(&method, rest, claims),
        Role::Child => allow_child(&method, rest, claims),
    };

    if let Err(err) = decision {
        tracing::warn!(
            method = %method,
            path = %path,
            username = %claims.sub,
            role = ?claims.role,
            "ACL: no rule matched; denying"
        );
        return Err(err);
    }

    Ok(next.run(req).await)
}

fn allow_parent(method: &Method, rest: &[&str], claims: &JwtClaims) -> Result<(), AppError> {
    match rest {
        ["children"] if *method == Method::GET => Ok(()),
        ["children", _, "preferences"] if *method == Method::GET || *method == Method::PUT => {
            Ok(())
        }
        ["children", _, "overview"] if *method == Method::GET => Ok(()),
        ["children", _, "reward"] if *method == Method::GET => Ok(()),
        ["children", _, "rewards"] if *method == Method::POST => Ok(()),
        ["children", _, "rewards", id]
            if (*method == Method::POST || *method == Method::DELETE)
                && id.parse::<i32>().is_ok() =>
        {
            Ok(())
        }
        ["children", _, "rewards", id, "claim"]
            if *method == Method::POST && id.parse::<i32>().is_ok() =>
        {
            Ok(())
        }
        // A parent may only delete their own account.
        ["parents", parent] if *method == Method::DELETE => ensure_self(claims, parent),
        _ => Err(AppError::forbidden()),
    }
}

fn allow_child(method: &Method, rest: &[&str], claims: &JwtClaims) -> Result<(), AppError> {
    match rest {
        ["tasks"] if *method == Method::GET || *method == Method::POST => Ok(()),
        ["tasks", id] if (*method == Method::GET || *method == Method::DELETE)
            && id.parse::<i32>().is_ok() =>
        {
            Ok(())
        }
        ["tasks", id, action]
            if *method == Method::POST
                && id.parse::<i32>().is_ok()
                && matches!(*action, "start" | "pause" | "finish" | "finish-early") =>
        {
            Ok(())
        }
        ["children", child, "reward"] if *method == Method::GET => ensure_self(claims, child),
        _ => Err(AppError::forbidden()),
    }
}

fn segmented(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn decode(seg: &str) -> String {
    percent_decode_str(seg).decode_utf8_lossy().to_string()
}

fn ensure_self(claims: &JwtClaims, seg: &str) -> Result<(), AppError> {
    if claims.sub == decode(seg) {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}
