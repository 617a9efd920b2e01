//! Alt-text candidates for product images.
//!
//! An upload is validated and decoded ([`intake`]), a vision model ranks
//! labels for it ([`classify`]), and the surviving labels are combined with
//! user keywords and a description into candidate strings ([`compose`]).
//! [`session`] ties these together as one stateful user session.

pub mod classify;
pub mod compose;
pub mod intake;
pub mod session;
