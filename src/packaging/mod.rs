//! 章节打包：把暂存目录里的图片写成单个 CBZ 归档。

pub mod cbz;

pub use cbz::{ArchiveError, Archiver};
