//! Directory-backed report source: a cursor over the regular files of a
//! local drop directory.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::DirectoryConfig;
use crate::error::{ItemError, SourceError};
use crate::mailbox::MessageOverview;

use super::action::{ActionKind, SourceAction};
use super::{ReportFile, Source, SourceKind, SourceParams};

const DEFAULT_DONE: &str = "move_to:done";
const DEFAULT_FAILED: &str = "move_to:failed";

pub struct DirectorySource {
    name: String,
    dir: PathBuf,
    /// Snapshot of regular files, sorted by name, taken at rewind.
    list: Vec<PathBuf>,
    index: usize,
    when_done: Vec<SourceAction>,
    when_failed: Vec<SourceAction>,
}

impl DirectorySource {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            name: config.name,
            dir: config.path,
            list: Vec::new(),
            index: 0,
            when_done: SourceAction::from_settings(&[], true, DEFAULT_DONE),
            when_failed: SourceAction::from_settings(&[], true, DEFAULT_FAILED),
        }
    }

    fn current_path(&self) -> Result<&Path, ItemError> {
        self.list
            .get(self.index)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                ItemError::File(io::Error::new(io::ErrorKind::NotFound, "cursor out of range"))
            })
    }

    async fn apply_actions(&self, actions: &[SourceAction]) -> Result<(), SourceError> {
        let Some(path) = self.list.get(self.index) else {
            return Ok(());
        };
        for action in actions {
            match action.kind {
                ActionKind::MarkSeen => {}
                ActionKind::Move => {
                    let Some(target) = &action.param else {
                        continue;
                    };
                    let Some(filename) = path.file_name() else {
                        continue;
                    };
                    let target_dir = self.dir.join(target);
                    std::fs::create_dir_all(&target_dir)?;
                    std::fs::rename(path, target_dir.join(filename))?;
                }
                ActionKind::Delete => std::fs::remove_file(path)?,
            }
        }
        Ok(())
    }
}

impl Source for DirectorySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Directory
    }

    fn label(&self) -> String {
        format!("{} ({})", self.dir.display(), self.name)
    }

    fn configure(&mut self, params: &SourceParams) {
        // Targets must stay inside the drop directory, so only plain
        // names are accepted here.
        self.when_done = SourceAction::from_settings(&params.when_done, true, DEFAULT_DONE);
        self.when_failed = SourceAction::from_settings(&params.when_failed, true, DEFAULT_FAILED);
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        let mut list = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                list.push(entry.path());
            }
        }
        list.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        self.list = list;
        self.index = 0;
        Ok(())
    }

    fn valid(&self) -> bool {
        self.index < self.list.len()
    }

    fn key(&self) -> usize {
        self.index
    }

    async fn current(&mut self) -> Result<ReportFile, ItemError> {
        let path = self.current_path()?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mime_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = std::fs::read(path).map_err(ItemError::File)?;
        Ok(ReportFile {
            filename,
            mime_type,
            data,
        })
    }

    fn next(&mut self) {
        self.index += 1;
    }

    async fn accepted(&mut self) -> Result<(), SourceError> {
        self.apply_actions(&self.when_done).await
    }

    async fn rejected(&mut self) -> Result<(), SourceError> {
        self.apply_actions(&self.when_failed).await
    }

    async fn overview(&mut self) -> Option<MessageOverview> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_for(dir: &Path) -> DirectorySource {
        DirectorySource::new(DirectoryConfig {
            name: "drop".to_string(),
            path: dir.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn lists_regular_files_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.xml"), b"<b/>").unwrap();
        std::fs::write(dir.path().join("a.xml"), b"<a/>").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut source = source_for(dir.path());
        source.rewind().await.unwrap();

        let first = source.current().await.unwrap();
        assert_eq!(first.filename, "a.xml");
        assert_eq!(first.mime_type, "text/xml");
        assert_eq!(first.data, b"<a/>");

        source.next();
        assert_eq!(source.current().await.unwrap().filename, "b.xml");
        source.next();
        assert!(!source.valid());
    }

    #[tokio::test]
    async fn default_dispositions_move_files_to_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.xml"), b"<a/>").unwrap();
        std::fs::write(dir.path().join("wat.xml"), b"<b/>").unwrap();

        let mut source = source_for(dir.path());
        source.rewind().await.unwrap();

        source.current().await.unwrap();
        source.accepted().await.unwrap();
        source.next();
        source.current().await.unwrap();
        source.rejected().await.unwrap();

        assert!(dir.path().join("done/ok.xml").is_file());
        assert!(dir.path().join("failed/wat.xml").is_file());
        assert!(!dir.path().join("ok.xml").exists());
    }

    #[tokio::test]
    async fn delete_disposition_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r.xml"), b"<a/>").unwrap();

        let mut source = source_for(dir.path());
        source.configure(&SourceParams {
            when_done: vec!["delete".to_string()],
            when_failed: Vec::new(),
        });
        source.rewind().await.unwrap();
        source.current().await.unwrap();
        source.accepted().await.unwrap();

        assert!(!dir.path().join("r.xml").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let mut source = source_for(&missing);
        assert!(matches!(
            source.rewind().await,
            Err(SourceError::Directory(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_file_fails_only_the_item() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r.xml"), b"<a/>").unwrap();

        let mut source = source_for(dir.path());
        source.rewind().await.unwrap();
        // File disappears between the snapshot and the read.
        std::fs::remove_file(dir.path().join("r.xml")).unwrap();

        assert!(matches!(
            source.current().await,
            Err(ItemError::File(_))
        ));
        assert!(source.valid());
    }
}
