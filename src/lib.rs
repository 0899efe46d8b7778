pub mod adapter;
pub mod aux_codec;
pub mod barcode;
pub mod cli;
pub mod errors;
pub mod header_mutator;
pub mod logging;
pub mod read_to_tags;
pub mod record_stream;
pub mod spatial;
pub mod util;
pub mod worker_pool;
pub mod writers;
