//! Job bundles: the caller's script plus a generated launcher.
//!
//! The launcher runs the script, captures its combined output and exit
//! code, and posts them to the inbound completion callback. The bundle is
//! kept on disk under `<work_dir>/<node_id>/<job_id>/` and shipped into the
//! node container as a tar archive rooted at [`CONTAINER_ROOT`].

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;

/// Directory inside node containers that holds job bundles.
pub const CONTAINER_ROOT: &str = "minicloud/jobs";

const SCRIPT_FILE: &str = "script.sh";
const LAUNCHER_FILE: &str = "run.sh";

/// A job ready to ship to a node.
#[derive(Debug, Clone)]
pub struct JobBundle {
    pub job_id: String,
    pub node_id: String,
    pub script: Bytes,
    pub launcher: String,
}

impl JobBundle {
    /// `job_id` and `node_id` must already be validated as safe path
    /// components; they are embedded in paths and in the launcher.
    pub fn new(job_id: &str, node_id: &str, script: Bytes, callback_base: &str) -> Self {
        let launcher = launcher_script(job_id, node_id, callback_base);
        Self {
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            script,
            launcher,
        }
    }

    /// Directory of this bundle inside the container, without the leading `/`.
    pub fn container_dir(&self) -> String {
        format!("{CONTAINER_ROOT}/{}", self.job_id)
    }

    /// Command that starts the job inside the container.
    pub fn command(&self) -> Vec<String> {
        vec![
            "/bin/bash".to_string(),
            format!("/{}/{LAUNCHER_FILE}", self.container_dir()),
        ]
    }

    /// Write the bundle under `<work_dir>/<node_id>/<job_id>/`.
    pub async fn persist(&self, work_dir: &Path) -> io::Result<PathBuf> {
        let dir = work_dir.join(&self.node_id).join(&self.job_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(SCRIPT_FILE), &self.script).await?;
        fs::write(dir.join(LAUNCHER_FILE), &self.launcher).await?;
        Ok(dir)
    }

    /// Tar archive to extract at the container's filesystem root.
    pub fn to_tar(&self) -> io::Result<Bytes> {
        let dir = self.container_dir();
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, &format!("{dir}/{SCRIPT_FILE}"), &self.script)?;
        append_file(
            &mut builder,
            &format!("{dir}/{LAUNCHER_FILE}"),
            self.launcher.as_bytes(),
        )?;
        Ok(Bytes::from(builder.into_inner()?))
    }
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

fn launcher_script(job_id: &str, node_id: &str, callback_base: &str) -> String {
    let callback = format!("{}/internal/callback", callback_base.trim_end_matches('/'));
    format!(
        r#"#!/bin/bash
cd "$(dirname "$0")"
chmod +x ./{SCRIPT_FILE}
OUTPUT="$(./{SCRIPT_FILE} 2>&1)"
EXIT_CODE=$?

if ! command -v curl >/dev/null 2>&1 || ! command -v jq >/dev/null 2>&1; then
    apt-get update -qq >/dev/null 2>&1
    apt-get install -y -qq curl jq >/dev/null 2>&1
fi

jq -n \
    --arg job_id "{job_id}" \
    --arg node_id "{node_id}" \
    --argjson exit_code "$EXIT_CODE" \
    --arg output "$OUTPUT" \
    '{{job_id: $job_id, node_id: $node_id, exit_code: $exit_code, output: $output}}' \
| curl -s -X POST -H 'Content-Type: application/json' --data-binary @- "{callback}"
"#
    )
}
