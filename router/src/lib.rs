//! The routing brain: deciding which backends receive a namespace's data.
//!
//! [`resolver::Resolver`] turns a namespace into a backend list by asking
//! the registry, [`cache::RouteCache`] keeps those answers warm and
//! refreshed, and [`handler::PointsHandler`] glues a bus topic to the
//! write path.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cache;
pub mod handler;
pub mod resolver;

pub use cache::RouteCache;
pub use handler::PointsHandlerFactory;
pub use resolver::Resolver;
