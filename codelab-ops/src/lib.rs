pub mod compress;
pub mod config;
pub mod credential;
pub mod envelope;
pub mod errors;
pub mod humanize;
pub mod inference;
pub mod kms;
pub mod storage;
