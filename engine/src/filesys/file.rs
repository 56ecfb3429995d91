//! File operations

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::errors::EngineError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, EngineError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Read a JSON-lines file; a torn final line is ignored
    pub async fn read_json_lines<T: DeserializeOwned>(&self) -> Result<Vec<T>, EngineError> {
        if !self.exists().await {
            return Ok(Vec::new());
        }
        let contents = self.read_string().await?;
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty()).peekable();
        let mut values = Vec::new();
        while let Some(line) = lines.next() {
            match serde_json::from_str(line) {
                Ok(value) => values.push(value),
                Err(_) if lines.peek().is_none() => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(values)
    }

    /// Write string to file
    pub async fn write_string(&self, contents: &str) -> Result<(), EngineError> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write JSON atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), EngineError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Append one JSON document per line and sync
    pub async fn append_json_lines<T: Serialize>(&self, values: &[T]) -> Result<(), EngineError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for value in values {
            serde_json::to_writer(&mut buf, value)?;
            buf.push(b'\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Make a JSON-lines file end on a line boundary after an interrupted
    /// append. A final line that parses is kept and terminated, anything
    /// else is cut off. Returns whether the file was changed.
    pub async fn repair_json_lines(&self) -> Result<bool, EngineError> {
        if !self.exists().await {
            return Ok(false);
        }
        let contents = fs::read(&self.path).await?;
        if contents.is_empty() || contents.ends_with(b"\n") {
            return Ok(false);
        }
        let keep = contents
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);

        let mut file = fs::OpenOptions::new().write(true).open(&self.path).await?;
        if serde_json::from_slice::<serde_json::Value>(&contents[keep..]).is_ok() {
            file.seek(SeekFrom::End(0)).await?;
            file.write_all(b"\n").await?;
        } else {
            file.set_len(keep as u64).await?;
        }
        file.sync_all().await?;
        Ok(true)
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), EngineError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Atomic write using a temporary file
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("tmp");

        // Write to temp file
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        // Rename to target
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
