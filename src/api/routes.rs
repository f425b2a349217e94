use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

use crate::api::handlers::AppState;
use crate::api::{branch_handlers, handlers, serve_handlers};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>(max_upload_bytes: usize) -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Deploys
        .route(
            "/orgs/:org_id/games/:game_id/branches/:slug/deploys",
            post(handlers::start_deploy::<S>),
        )
        .route(
            "/orgs/:org_id/games/:game_id/branches/:slug/archive",
            post(handlers::full_deploy::<S>),
        )
        .route("/deploys/:deploy_id", get(handlers::get_deploy::<S>))
        .route(
            "/deploys/:deploy_id/assets/*path",
            put(handlers::upload_asset::<S>),
        )
        .route(
            "/deploys/:deploy_id/activate",
            post(handlers::activate_deploy::<S>),
        )
        // Branch settings
        .route(
            "/branches/:branch_id/password",
            put(branch_handlers::set_branch_password::<S>),
        )
        .route(
            "/branches/:branch_id/pinned",
            put(branch_handlers::set_branch_pinned::<S>),
        )
        .route(
            "/branches/:branch_id",
            delete(branch_handlers::delete_branch::<S>),
        )
        // Serving
        .route(
            "/play/:org_id/:game_id/:slug",
            get(serve_handlers::redirect_to_index),
        )
        .route(
            "/play/:org_id/:game_id/:slug/",
            get(serve_handlers::serve_index::<S>),
        )
        .route(
            "/play/:org_id/:game_id/:slug/*path",
            get(serve_handlers::serve_asset::<S>).post(serve_handlers::submit_password::<S>),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}
