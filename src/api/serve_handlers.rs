//! Public delivery of the active deploy under `/play`, including the
//! password gate for protected branches.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use serde::Deserialize;

use crate::api::handlers::{api_error, AppState};
use crate::error::PipelineError;
use crate::logic::serve::PASSWORD_PATH;
use crate::logic::{resolve_asset_path, ServeOutcome, ServeRequest};
use crate::model::{http_date, parse_http_date, BranchAddress, Id};
use crate::storage::paths::normalize_relative_path;
use crate::store::traits::Store;

#[derive(Debug, Default, Deserialize)]
pub struct PasswordQuery {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    pub password: String,
    pub next: Option<String>,
}

fn branch_base(address: &BranchAddress) -> String {
    format!(
        "/play/{}/{}/{}/",
        address.org_id, address.game_id, address.slug
    )
}

/// Percent-encode everything outside the unreserved set and `/`
fn encode_query_value(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

/// Only relative asset paths inside the branch are valid redirect targets
fn safe_next(next: Option<&str>) -> String {
    next.filter(|next| !next.is_empty())
        .and_then(|next| normalize_relative_path(&resolve_asset_path(next)).ok())
        .unwrap_or_default()
}

async fn serve<S: Store>(
    pipeline: AppState<S>,
    address: BranchAddress,
    asset_path: String,
    query: PasswordQuery,
    headers: HeaderMap,
) -> Response {
    if asset_path == PASSWORD_PATH {
        let next = safe_next(query.next.as_deref());
        return password_page(&address, &next, None, StatusCode::OK);
    }

    let request = ServeRequest {
        if_modified_since: headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date),
        cookie_header: headers
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok()),
    };

    match pipeline.serve_asset(&address, &asset_path, request).await {
        Ok(ServeOutcome::Asset(asset)) => (
            [
                (header::CONTENT_TYPE, asset.content_type),
                (header::CACHE_CONTROL, asset.cache_control.to_string()),
                (header::LAST_MODIFIED, http_date(&asset.last_modified)),
            ],
            asset.bytes,
        )
            .into_response(),
        Ok(ServeOutcome::NotModified { last_modified }) => (
            StatusCode::NOT_MODIFIED,
            [(header::LAST_MODIFIED, http_date(&last_modified))],
        )
            .into_response(),
        Ok(ServeOutcome::PasswordRequired { asset_path, .. }) => Redirect::to(&format!(
            "{}{}?next={}",
            branch_base(&address),
            PASSWORD_PATH,
            encode_query_value(&asset_path)
        ))
        .into_response(),
        Err(e) => api_error(e).into_response(),
    }
}

/// GET /play/{org}/{game}/{slug}/{*path}
pub async fn serve_asset<S: Store>(
    Path((org_id, game_id, slug, path)): Path<(Id, Id, String, String)>,
    State(pipeline): State<AppState<S>>,
    Query(query): Query<PasswordQuery>,
    headers: HeaderMap,
) -> Response {
    let address = BranchAddress::new(org_id, game_id, slug);
    serve(pipeline, address, path, query, headers).await
}

/// GET /play/{org}/{game}/{slug}/
pub async fn serve_index<S: Store>(
    Path((org_id, game_id, slug)): Path<(Id, Id, String)>,
    State(pipeline): State<AppState<S>>,
    headers: HeaderMap,
) -> Response {
    let address = BranchAddress::new(org_id, game_id, slug);
    serve(pipeline, address, String::new(), PasswordQuery::default(), headers).await
}

/// GET /play/{org}/{game}/{slug}
/// Relative asset URLs only resolve below the trailing slash
pub async fn redirect_to_index(Path((org_id, game_id, slug)): Path<(Id, Id, String)>) -> Redirect {
    Redirect::permanent(&branch_base(&BranchAddress::new(org_id, game_id, slug)))
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn password_page(
    address: &BranchAddress,
    next: &str,
    error: Option<&str>,
    status: StatusCode,
) -> Response {
    let message = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape_html(e)))
        .unwrap_or_default();
    let body = format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Password required</title></head>
<body>
<h1>{slug} is password protected</h1>
{message}
<form method="post" action="{base}{form}">
<input type="password" name="password" autofocus>
<input type="hidden" name="next" value="{next}">
<button type="submit">Continue</button>
</form>
</body>
</html>"#,
        slug = escape_html(&address.slug),
        message = message,
        base = branch_base(address),
        form = PASSWORD_PATH,
        next = escape_html(next),
    );
    (status, Html(body)).into_response()
}

async fn check_password<S: Store>(
    pipeline: AppState<S>,
    address: BranchAddress,
    form: PasswordForm,
) -> Response {
    let next = safe_next(form.next.as_deref());

    match pipeline.verify_branch_password(&address, &form.password).await {
        Ok((name, token)) => {
            let base = branch_base(&address);
            let cookie = format!("{}={}; Path={}; HttpOnly; SameSite=Lax", name, token, base);
            let mut response = Redirect::to(&format!("{}{}", base, next)).into_response();
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().insert(header::SET_COOKIE, value);
                    response
                }
                Err(e) => api_error(PipelineError::Internal(e.into())).into_response(),
            }
        }
        Err(PipelineError::Authorization(_)) => password_page(
            &address,
            &next,
            Some("Wrong password, try again."),
            StatusCode::UNAUTHORIZED,
        ),
        Err(e) => api_error(e).into_response(),
    }
}

/// POST /play/{org}/{game}/{slug}/_password
pub async fn submit_password<S: Store>(
    Path((org_id, game_id, slug, path)): Path<(Id, Id, String, String)>,
    State(pipeline): State<AppState<S>>,
    Form(form): Form<PasswordForm>,
) -> Response {
    if path != PASSWORD_PATH {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    check_password(pipeline, BranchAddress::new(org_id, game_id, slug), form).await
}
