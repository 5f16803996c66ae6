pub mod handlers;
pub mod identity;
pub mod response;
pub mod routes;

pub use routes::create_router;
