//! Job catalog and descriptor persistence.
//!
//! `DatabaseMetadata` is the append-only list of jobs keyed by integer id,
//! persisted as a single blob; a `JobDescriptor` is persisted per job at
//! completion. Both go through the backend's atomic save with bounded
//! backoff.

use serde::{Deserialize, Serialize};
use strobe_common::{JobId, Result, StrobeError};
use strobe_storage::{layout, save_blob, StorageBackend};

use crate::plan::Task;

/// Value type of an output column. The engine does not type its outputs;
/// descriptors record `None` and downstream consumers attach meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Untyped raw bytes.
    None,
}

/// One output column of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    /// Sequential column id within the job.
    pub id: i32,
    /// Column name from the final evaluator's output schema.
    pub name: String,
    /// Column value type.
    pub column_type: ColumnType,
}

/// Per-job metadata persisted when the job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job id from the database metadata catalog.
    pub id: JobId,
    /// User-supplied job name.
    pub name: String,
    /// Rows per IO item used for this job.
    pub io_item_size: usize,
    /// Rows per intra-pipeline work item used for this job.
    pub work_item_size: usize,
    /// Workers registered when the job ran.
    pub num_nodes: usize,
    /// Output schema, one entry per final-evaluator output column.
    pub columns: Vec<ColumnDesc>,
    /// Tasks copied verbatim from the submitted task set.
    pub tasks: Vec<Task>,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    /// Assigned job id.
    pub id: JobId,
    /// Job name.
    pub name: String,
}

/// Append-only catalog of jobs, persisted as one blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    jobs: Vec<JobEntry>,
}

impl DatabaseMetadata {
    /// Read the catalog, or return an empty one if it was never written.
    pub fn read_or_default(backend: &dyn StorageBackend) -> Result<Self> {
        let key = layout::db_metadata_path();
        if !backend.exists(&key) {
            return Ok(Self::default());
        }
        let blob = backend.read_blob(&key)?;
        serde_json::from_slice(&blob)
            .map_err(|e| StrobeError::Storage(format!("database metadata decode failed: {e}")))
    }

    /// All registered jobs in id order.
    pub fn jobs(&self) -> &[JobEntry] {
        &self.jobs
    }

    /// The id the next registered job will receive.
    pub fn next_job_id(&self) -> JobId {
        JobId(self.jobs.len() as i32)
    }

    /// Append a job and return its assigned id.
    pub fn add_job(&mut self, name: &str) -> JobId {
        let id = self.next_job_id();
        self.jobs.push(JobEntry {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Persist the catalog through the backend's atomic save.
    pub fn write(&self, backend: &dyn StorageBackend) -> Result<()> {
        let blob = serde_json::to_vec_pretty(self)
            .map_err(|e| StrobeError::Storage(format!("database metadata encode failed: {e}")))?;
        save_blob(backend, &layout::db_metadata_path(), &blob)
    }
}

/// Persist a job descriptor under its id.
pub fn write_job_descriptor(backend: &dyn StorageBackend, descriptor: &JobDescriptor) -> Result<()> {
    let blob = serde_json::to_vec_pretty(descriptor)
        .map_err(|e| StrobeError::Storage(format!("job descriptor encode failed: {e}")))?;
    save_blob(backend, &layout::job_descriptor_path(descriptor.id), &blob)
}

/// Read a job descriptor back by id.
pub fn read_job_descriptor(backend: &dyn StorageBackend, job_id: JobId) -> Result<JobDescriptor> {
    let blob = backend.read_blob(&layout::job_descriptor_path(job_id))?;
    serde_json::from_slice(&blob)
        .map_err(|e| StrobeError::Storage(format!("job descriptor decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use strobe_storage::FsBackend;

    use super::*;

    fn temp_backend(prefix: &str) -> FsBackend {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        FsBackend::new(std::env::temp_dir().join(format!("{prefix}_{nanos}"))).expect("backend")
    }

    #[test]
    fn job_ids_are_sequential_and_survive_reload() {
        let backend = temp_backend("strobe_meta");
        let mut meta = DatabaseMetadata::read_or_default(&backend).expect("read");
        assert_eq!(meta.add_job("first"), JobId(0));
        assert_eq!(meta.add_job("second"), JobId(1));
        meta.write(&backend).expect("write");

        let reloaded = DatabaseMetadata::read_or_default(&backend).expect("reload");
        assert_eq!(reloaded.jobs().len(), 2);
        assert_eq!(reloaded.next_job_id(), JobId(2));
        assert_eq!(reloaded.jobs()[1].name, "second");
    }

    #[test]
    fn descriptor_round_trips() {
        let backend = temp_backend("strobe_meta_desc");
        let descriptor = JobDescriptor {
            id: JobId(4),
            name: "person_job".to_string(),
            io_item_size: 1024,
            work_item_size: 128,
            num_nodes: 2,
            columns: vec![ColumnDesc {
                id: 0,
                name: "feature".to_string(),
                column_type: ColumnType::None,
            }],
            tasks: Vec::new(),
        };
        write_job_descriptor(&backend, &descriptor).expect("write");
        let read = read_job_descriptor(&backend, JobId(4)).expect("read");
        assert_eq!(read, descriptor);
    }
}
