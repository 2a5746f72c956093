use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod auth_routes;
pub mod clinic_routes;
pub mod consultation_routes;
pub mod home_routes;
pub mod odontogram_routes;
pub mod patient_routes;
pub mod payment_routes;
pub mod radiography_routes;
pub mod report_routes;
pub mod staff_routes;
pub mod treatment_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/staff", staff_routes::router())
        .nest("/api/v1/reports", report_routes::router())
        .nest("/api/v1", clinic_routes::router())
        .nest("/api/v1", patient_routes::router())
        .nest("/api/v1", appointment_routes::router())
        .nest("/api/v1", consultation_routes::router())
        .nest("/api/v1", treatment_routes::router())
        .nest("/api/v1", payment_routes::router())
        .nest("/api/v1", odontogram_routes::router())
        .nest("/api/v1", radiography_routes::router(state.max_upload_bytes))
        .merge(home_routes::router())
        .with_state(state)
}
