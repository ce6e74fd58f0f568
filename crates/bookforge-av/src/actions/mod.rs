//! Conversion actions: whole-book M4B decrypt, per-chapter MP3 export and
//! cover extraction.

mod chapter;
mod cover;
mod m4b;

pub use chapter::{chapter_file_name, convert_chapter, ChapterJob};
pub use cover::{extract_cover, COVER_MAX_EDGE};
pub use m4b::convert_to_m4b;
