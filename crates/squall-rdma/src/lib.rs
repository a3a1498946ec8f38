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

pub mod buf;
mod ctx;
mod err;
pub mod exchange;
mod mgr;
pub mod provider;
mod region;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub(crate) mod util;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

pub use buf::{BufSlice, RegionBuf};
pub use ctx::RdmaTransport;
pub use err::Error;
pub use mgr::{ConnMgr, Connection};
pub use region::MemoryRegion;
pub use provider::TransportSelection;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifier of a participating process.
///
/// Node ids are assigned by the deployment and are unique per process.
/// They also determine row ranks: the members of a table are ordered by
/// ascending id, and a node's rank is its position in that order.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);
