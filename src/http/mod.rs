//! HTTP surface: the axum router and the card request service behind it.

pub mod cards;
pub mod handler;
