use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// Creates temporary message files for a single session.
pub struct Spool {
    dir: Utf8PathBuf,
    keep: bool,
}

impl Spool {
    pub fn new<P: AsRef<Utf8Path>>(dir: P, keep: bool) -> Self {
        Spool {
            dir: dir.as_ref().to_owned(),
            keep,
        }
    }

    pub async fn create(&self, label: &str) -> io::Result<SpoolFile> {
        let path = self.dir.join(format!("shrike-{}.{}", Ulid::new(), label));
        let file = File::create(&path).await?;
        Ok(SpoolFile {
            path,
            file: Some(file),
            keep: self.keep,
        })
    }
}

/// A spool file owned by the session. Removed on drop unless the spool was
/// configured to keep files for debugging.
pub struct SpoolFile {
    path: Utf8PathBuf,
    file: Option<File>,
    keep: bool,
}

impl SpoolFile {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "spool file already finished",
            )),
        }
    }

    /// Flushes and closes the write handle. The content stays readable
    /// through `reader` until the file is dropped.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    pub async fn reader(&self) -> io::Result<File> {
        File::open(&self.path).await
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
