//! Blob key layout under the configured storage root.
//!
//! Contract:
//! - `db_metadata.bin` is the single catalog blob;
//! - per-job blobs live under `jobs/<job_id>/`;
//! - saved outputs are keyed by job name, table, column and IO item index;
//! - source table columns live under `tables/job_<j>/table_<t>/`.

use strobe_common::{ColumnId, JobId, NodeId, TableId};

/// Key of the append-only database metadata catalog.
pub fn db_metadata_path() -> String {
    "db_metadata.bin".to_string()
}

/// Key of a job's persisted descriptor.
pub fn job_descriptor_path(job_id: JobId) -> String {
    format!("jobs/{job_id}/descriptor.bin")
}

/// Key of one node's profiler file for a job.
pub fn job_profiler_path(job_id: JobId, node_id: NodeId) -> String {
    format!("jobs/{job_id}/profiler_node_{node_id}.bin")
}

/// Key of one saved output column slice for one IO item.
pub fn output_item_path(
    job_name: &str,
    table_id: TableId,
    column_id: ColumnId,
    io_item_index: usize,
) -> String {
    format!("jobs/{job_name}/table_{table_id}/column_{column_id}/item_{io_item_index}.bin")
}

/// Key of a source table column blob.
pub fn table_column_path(job_id: JobId, table_id: TableId, column_id: ColumnId) -> String {
    format!("tables/job_{job_id}/table_{table_id}/column_{column_id}.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable() {
        assert_eq!(db_metadata_path(), "db_metadata.bin");
        assert_eq!(job_descriptor_path(JobId(3)), "jobs/3/descriptor.bin");
        assert_eq!(
            job_profiler_path(JobId(3), NodeId(1)),
            "jobs/3/profiler_node_1.bin"
        );
        assert_eq!(
            output_item_path("person_job", TableId(0), ColumnId(2), 14),
            "jobs/person_job/table_0/column_2/item_14.bin"
        );
        assert_eq!(
            table_column_path(JobId(0), TableId(4), ColumnId(1)),
            "tables/job_0/table_4/column_1.bin"
        );
    }
}
