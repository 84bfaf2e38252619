mod auth_routes;
pub mod dto;
mod nodes;
pub mod response;
mod router;
mod ws;

pub use router::{AppState, create_router};
