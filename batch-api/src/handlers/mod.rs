mod app;
mod batches;
mod files;
mod health;
mod webhooks;

pub use app::{add_routes, AppState};
