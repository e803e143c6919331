//! # raind-image
//!
//! Container image management for raind.
//!
//! This crate provides:
//! - Image reference parsing and normalization
//! - The image layer manager (ILM) store
//! - Registry pulls with digest verification and layer extraction
//! - The materializer that ties the store and the puller together

#![warn(missing_docs)]

pub mod layer;
pub mod manager;
pub mod reference;
pub mod registry;
pub mod store;

pub use manager::ImageManager;
pub use reference::{ImageReference, ImageTag};
pub use registry::{ImagePuller, RegistryPuller};
pub use store::{ImageEntry, ImageRecord, ImageStore};
