pub mod checkpoint;
pub mod detector;
pub mod extractor;
pub mod jobs;
pub mod ledger;
pub mod lister;
pub mod pipeline;
pub mod storage;
