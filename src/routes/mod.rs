use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod flow_routes;
pub mod occupancy_routes;
pub mod template_routes;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(appointment_routes::router())
        .merge(template_routes::router())
        .merge(flow_routes::router())
        .merge(occupancy_routes::router());

    Router::new().nest("/api/v1", api).with_state(state)
}
