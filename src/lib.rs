//! Briefcase management for centrally versioned iModels.
//!
//! A *briefcase* is a local working copy of an iModel, materialized from a
//! sealed *checkpoint* plus a linear chain of *changesets* served by a
//! central *hub*. This crate implements the briefcase cache and its
//! synchronization machinery; the hub and the native storage engine that
//! understands the briefcase file format are consumed as capabilities (see
//! [`hub::HubClient`] and [`native::NativeEngine`]).

pub mod tools;

pub mod hub;

pub mod native;

pub mod briefcase;
