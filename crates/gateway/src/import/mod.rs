//! Import staging — external-system migration into a running gateway.

pub mod openclaw;
