//! # Hash Harvester
//!
//! A harvesting engine that discovers software artifacts in heterogeneous
//! repositories, unpacks each artifact down to its constituent files, and
//! produces a hash set: for every extracted file a SHA-256 digest,
//! provenance back to the source artifact, and optionally the bytes.
//!
//! The engine is connector-driven. [`traits::Importer`]s discover sources,
//! a [`traits::Processor`] turns each preprocessed source into a flat file
//! tree with a `hashes.json` manifest, the per-repository [`cache`]
//! decides which files are new, and [`traits::Exporter`]s persist the
//! surviving samples. The [`engine::Harvester`] coordinates all of it:
//! repositories sequentially, sources within a repository across a
//! bounded worker pool, each source processed exactly once per quick-hash
//! thanks to the [`jobstore`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod exporter_postgres;
pub mod hashing;
pub mod importer_common;
pub mod importer_deb;
pub mod importer_iso;
pub mod importer_targz;
pub mod importer_wim;
pub mod importer_zip;
pub mod jobstore;
pub mod models;
pub mod processor;
pub mod traits;
