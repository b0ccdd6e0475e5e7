//! Adapter utilities for the `virtual-collection` crate.
//!
//! The `virtual-collection` crate is UI-agnostic and only talks to its consumer through the
//! `RenderCallback` contract. This crate provides the pieces most adapters would otherwise
//! write themselves:
//!
//! - An in-memory `RenderCallback` store with a pluggable row renderer
//! - An event-driven controller (render, fetch, scroll, measure, expand, collapse, mutate)
//!
//! This crate is intentionally framework-agnostic (no DOM/egui/ratatui bindings).
#![forbid(unsafe_code)]

mod controller;
mod store;


pub use controller::Controller;
pub use store::{CollectionStore, RowRenderer};
