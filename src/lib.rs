pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod events;
pub mod helpers;
pub mod image;
pub mod image_store;
pub mod layer;
pub mod printing;
pub mod reference;
pub mod reference_store;
pub mod service;
pub mod state;
pub mod transfer;

#[cfg(test)]
mod test_helpers;
