// ABOUTME: Change notification: single-flight delivery, throttled table watches, watched queries

pub mod notifier;
pub mod query;
pub mod serial;
