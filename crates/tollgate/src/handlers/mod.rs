pub mod custom;
pub mod management;
pub mod providers;
pub mod proxy;
pub mod reporting;
pub mod request;
pub mod response;
pub mod routes;
pub mod streaming;
pub mod upstream;

pub use management::handle_admin;
pub use proxy::handle_proxy;
