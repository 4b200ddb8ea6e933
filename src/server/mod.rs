// Server module with routing and handlers

mod handlers;
mod middleware;
mod routes;

pub use routes::create_router;
