//! Byte-range partitioning for chunked downloads

use crate::types::{DownloadTask, TaskStatus};
use url::Url;

/// Partition `[0, len)` into chunk tasks of at most `chunk_size` bytes
///
/// The returned tasks form an exact, non-overlapping cover of the file: the
/// first starts at 0, each starts where the previous ended, and the last ends
/// at `len` (short when `len` is not a multiple of `chunk_size`). A zero
/// `len` yields no tasks.
pub fn partition(url: &Url, len: u64, chunk_size: u64) -> Vec<DownloadTask> {
    debug_assert!(chunk_size > 0, "validated by Config::validate");

    let mut tasks = Vec::with_capacity(len.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < len {
        let end = (start + chunk_size).min(len);
        tasks.push(DownloadTask {
            url: url.clone(),
            range: start..end,
            offset: start,
            attempt: 0,
            status: TaskStatus::Pending,
        });
        start = end;
    }
    tasks
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://feed.example.com/bulk.ndjson").unwrap()
    }

    fn assert_exact_cover(tasks: &[DownloadTask], len: u64) {
        let mut expected_start = 0;
        for task in tasks {
            assert_eq!(task.range.start, expected_start, "no gap, no overlap");
            assert_eq!(task.offset, task.range.start);
            assert!(!task.is_empty());
            expected_start = task.range.end;
        }
        assert_eq!(expected_start, len, "partition covers the whole file");
    }

    #[test]
    fn divisible_length_produces_equal_chunks() {
        let tasks = partition(&url(), 20 * 1024 * 1024, 2 * 1024 * 1024);
        assert_eq!(tasks.len(), 10);
        assert!(tasks.iter().all(|t| t.len() == 2 * 1024 * 1024));
        assert_exact_cover(&tasks, 20 * 1024 * 1024);
    }

    #[test]
    fn non_divisible_length_has_short_tail() {
        let tasks = partition(&url(), 10_000, 3_000);
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[3].len(), 1_000);
        assert_exact_cover(&tasks, 10_000);
    }

    #[test]
    fn file_smaller_than_chunk_is_one_task() {
        let tasks = partition(&url(), 100, 4 * 1024 * 1024);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].range, 0..100);
    }

    #[test]
    fn empty_file_yields_no_tasks() {
        assert!(partition(&url(), 0, 1024).is_empty());
    }

    #[test]
    fn all_tasks_start_pending() {
        let tasks = partition(&url(), 5_000, 1_024);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending && t.attempt == 0));
    }
}
