pub mod backoff;
pub mod classify;
pub mod clock;
pub mod concurrency;
pub mod controller;
pub mod job;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod quotactl;
pub mod service;
pub mod settings;
pub mod storage;
pub mod token_bucket;
pub mod trace;

pub use quota_macros::test;
