//! Per-job log files under `<work_dir>/<node_id>/<job_id>.log`.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_path(&self, node_id: &str, job_id: &str) -> PathBuf {
        self.root.join(node_id).join(format!("{job_id}.log"))
    }

    /// Persist a job's captured output. Written once per job.
    pub async fn write(&self, node_id: &str, job_id: &str, output: &str) -> io::Result<()> {
        let path = self.job_path(node_id, job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, output).await
    }

    /// `Ok(None)` when the job has not written a log yet.
    pub async fn read_job(&self, node_id: &str, job_id: &str) -> io::Result<Option<String>> {
        read_optional(&self.job_path(node_id, job_id)).await
    }

    /// Find a job's log without knowing its node.
    pub async fn find_job(&self, job_id: &str) -> io::Result<Option<String>> {
        let file_name = format!("{job_id}.log");
        for dir in self.node_dirs().await? {
            if let Some(content) = read_optional(&dir.join(&file_name)).await? {
                return Ok(Some(content));
            }
        }
        Ok(None)
    }

    /// Every log written on a node, ordered by job id.
    pub async fn read_node(&self, node_id: &str) -> io::Result<Option<String>> {
        let dir = self.root.join(node_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Ok(None);
        }
        paths.sort();

        let mut out = String::new();
        for path in paths {
            let job_id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            out.push_str(&format!("==> {job_id} <==\n"));
            out.push_str(&fs::read_to_string(&path).await?);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(Some(out))
    }

    /// Delete everything under the root and recreate it empty.
    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.root).await
    }

    async fn node_dirs(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
