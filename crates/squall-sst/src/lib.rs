#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]

mod config;
mod err;
pub mod layout;
mod liveness;
mod predicates;
mod table;

pub use config::{SstConfig, SstConfigBuilder, SstConfigBuilderError};
pub use err::Error;
pub use layout::{
    FieldElement, FieldRange, FieldSpan, ScalarField, SstLayout, SstLayoutBuilder, VectorField,
};
pub use predicates::{PredicateHandle, PredicateKind, Predicates};
pub use table::{Sst, SstHandle};

pub use squall_rdma::{NodeId, RdmaTransport, TransportSelection};

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
