//! Sidecar Controller registries
//!
//! Service discovery data may come from several independent platforms. Each platform is exposed
//! through an adapter implementing [`Registry`], and the [`Aggregate`] controller composes an
//! ordered list of adapters behind the same capability set:
//!
//! ```text
//! [ memory ] --\
//! [ file   ] ---+--> [ Aggregate ] --> services, instances, change notifications
//! [ ...    ] --/
//! ```
//!
//! Most lookups are first-match-wins in registration order, since distinct platforms are expected
//! to own disjoint hostnames. Listings (`services` and `host_instances`) are unions across every
//! adapter.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
mod catalog;
pub mod file;
pub mod memory;
mod platform;

pub use self::{
    aggregate::{Aggregate, AppendHandlerError, HandlerKind},
    catalog::{Catalog, CatalogError},
    file::FileRegistry,
    memory::MemoryRegistry,
    platform::Platform,
};
pub use sidecar_controller_core::Registry;
