//! Column family definitions for RocksDB.
//!
//! - checkpoints: pipeline progress (default compaction)
//! - records: search index records of every local index, keyed by index
//! - index_meta: per-index settings markers

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for pipeline checkpoints
pub const CF_CHECKPOINTS: &str = "checkpoints";

/// Column family name for index records
pub const CF_RECORDS: &str = "records";

/// Column family name for per-index metadata
pub const CF_INDEX_META: &str = "index_meta";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_CHECKPOINTS, CF_RECORDS, CF_INDEX_META];

/// Records are rewritten often (retry counters, due timestamps)
fn records_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_RECORDS, records_options()),
        ColumnFamilyDescriptor::new(CF_INDEX_META, Options::default()),
    ]
}
