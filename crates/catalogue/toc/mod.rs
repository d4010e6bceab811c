pub mod log;
pub mod record;

pub use log::{read_toc, TocIndexRef, TocSnapshot, TocWriter, SCHEMA_FILE_NAME, TOC_FILE_NAME};
pub use record::{
    AxesSnapshot, TocPayload, TocRecord, TocRecordKind, TOC_RECORD_ALIGN,
};
