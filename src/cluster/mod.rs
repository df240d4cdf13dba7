//! This module holds all the modules responsible for clustering support

/// Master and peer sides of the control channel
pub mod membership_protocol;

/// Connected peers and their control connections, kept by the master
pub mod registry;
