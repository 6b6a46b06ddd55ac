//! cmi5 package import and xAPI tracking runtime.

pub mod config;
pub mod db;
pub mod error;
pub mod importer;
pub mod launch;
pub mod lrs;
pub mod manifest;
pub mod models;
pub mod moveon;
pub mod packages;
pub mod routes;
pub mod statement;
pub mod storage;
pub mod structure;
pub mod uploader;
pub mod validate;
pub mod xapi;
