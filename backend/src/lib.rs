pub mod config;
pub mod explain;
pub mod imaging;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod routes;
