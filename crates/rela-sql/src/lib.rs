// SPDX-License-Identifier: Apache-2.0

//! SQL-side helpers for the dispatch layer: URI parsing, dialect rules,
//! placeholder binding, and statement classification.

pub mod bind;
pub mod classify;
pub mod dialect;
pub mod uri;

pub use bind::{inline_params, prepare, rewrite_placeholders};
pub use classify::returns_rows;
pub use dialect::{Dialect, PlaceholderStyle, QuoteStyle};
pub use uri::parse;
