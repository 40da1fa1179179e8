pub mod config;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod rank;
pub mod render;
pub mod sink;
pub mod table;
