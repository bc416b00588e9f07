//! CBZ 归档写入。
//!
//! 条目按文件名排序（补零的序号即归档顺序），统一放在 `<章节名>/` 下。
//! 压缩方式、级别与时间戳固定，相同输入得到逐字节相同的归档。
//! 先写目标目录下的临时文件，关闭后再改名，目标路径不会出现半成品。

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::base_system::context::sanitize_label;
use crate::download::models::ArchiveManifest;

const COMPRESSION_LEVEL: i32 = 6;
const ENTRY_PERMISSIONS: u32 = 0o644;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to write archive {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no *.{extension} files in {directory}")]
    Empty {
        directory: PathBuf,
        extension: String,
    },
}

#[derive(Debug, Clone)]
pub struct Archiver {
    extension: String,
}

impl Archiver {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    pub fn archive(
        &self,
        directory: &Path,
        chapter_label: &str,
        destination: &Path,
    ) -> Result<ArchiveManifest, ArchiveError> {
        let fail = |source: io::Error| ArchiveError::WriteFailed {
            path: destination.to_path_buf(),
            source,
        };

        let files = self.collect_images(directory).map_err(fail)?;
        if files.is_empty() {
            return Err(ArchiveError::Empty {
                directory: directory.to_path_buf(),
                extension: self.extension.clone(),
            });
        }

        let label = sanitize_label(chapter_label);
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(fail)?;

        let prefix = destination
            .file_name()
            .map(|n| format!(".{}.", n.to_string_lossy()))
            .unwrap_or_else(|| ".archive.".to_string());
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(fail)?;

        write_entries(tmp.as_file_mut(), &label, &files).map_err(fail)?;
        tmp.as_file().sync_all().map_err(fail)?;
        // 出错时 NamedTempFile 被丢弃，临时文件随之删除
        tmp.persist(destination).map_err(|e| fail(e.error))?;

        info!("已生成 {}（{} 张图片）", destination.display(), files.len());
        Ok(ArchiveManifest {
            archive_path: destination.to_path_buf(),
            entry_count: files.len(),
            source_chapter: chapter_label.to_string(),
        })
    }

    /// 目录下扩展名匹配的普通文件，按文件名排序。
    fn collect_images(&self, directory: &Path) -> io::Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension));
            if !matches {
                debug!("跳过非图片文件 {}", path.display());
                continue;
            }
            files.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

fn write_entries(file: &mut File, label: &str, files: &[(String, PathBuf)]) -> io::Result<()> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .last_modified_time(DateTime::default())
        .unix_permissions(ENTRY_PERMISSIONS);

    let mut zip = ZipWriter::new(file);
    for (name, path) in files {
        zip.start_file(format!("{label}/{name}"), options)
            .map_err(zip_to_io)?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish().map_err(zip_to_io)?;
    Ok(())
}

fn zip_to_io(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::write(dir.path().join(name), format!("image bytes of {name}")).unwrap();
        }
        dir
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn entries_are_sorted_and_labelled() {
        let src = staged(&["0003.jpg", "0001.jpg", "0001.jpg.x1y2.tmp", "notes.txt"]);
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("Berserk - Capitulo 1.cbz");

        let manifest = Archiver::new("jpg")
            .archive(src.path(), "Capítulo 1: ¿inicio?", &dest)
            .unwrap();

        assert_eq!(manifest.entry_count, 2);
        assert_eq!(manifest.archive_path, dest);
        assert_eq!(
            entry_names(&dest),
            vec!["Capítulo 1 inicio/0001.jpg", "Capítulo 1 inicio/0003.jpg"]
        );
    }

    #[test]
    fn dot_labels_cannot_escape_the_archive_root() {
        let src = staged(&["0001.jpg"]);
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("ch.cbz");

        Archiver::new("jpg").archive(src.path(), "..", &dest).unwrap();
        let names = entry_names(&dest);
        assert_eq!(names, vec!["unnamed/0001.jpg"]);
        assert!(names.iter().all(|n| !n.starts_with('.')));
    }

    #[test]
    fn identical_inputs_give_identical_bytes() {
        let src = staged(&["0001.jpg", "0002.jpg", "0010.jpg"]);
        let out = tempfile::tempdir().unwrap();
        let a = out.path().join("a.cbz");
        let b = out.path().join("b.cbz");

        let archiver = Archiver::new("jpg");
        archiver.archive(src.path(), "ch", &a).unwrap();
        archiver.archive(src.path(), "ch", &b).unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn replaces_previous_archive() {
        let src = staged(&["0001.jpg"]);
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("ch.cbz");
        fs::write(&dest, b"stale").unwrap();

        Archiver::new("jpg").archive(src.path(), "ch", &dest).unwrap();
        assert_eq!(entry_names(&dest), vec!["ch/0001.jpg"]);
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let src = staged(&["0001.jpg"]);
        let out = tempfile::tempdir().unwrap();
        // 目标是已存在的目录，改名必然失败
        let dest = out.path().join("taken.cbz");
        fs::create_dir(&dest).unwrap();

        let err = Archiver::new("jpg").archive(src.path(), "ch", &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::WriteFailed { .. }));

        let leftovers: Vec<_> = fs::read_dir(out.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["taken.cbz"]);
    }

    #[test]
    fn empty_directory_is_rejected() {
        let src = staged(&[]);
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("ch.cbz");
        assert!(matches!(
            Archiver::new("jpg").archive(src.path(), "ch", &dest),
            Err(ArchiveError::Empty { .. })
        ));
        assert!(!dest.exists());
    }
}
