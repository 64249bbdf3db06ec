//! Handlers served by tether workers.

pub mod welcome;
