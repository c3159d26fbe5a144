pub mod args;
pub mod node;
pub mod relay;
