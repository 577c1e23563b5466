//! Log part splitting for communication manager uploads.
//!
//! Collected log content is shipped in bounded parts; a request that would
//! exceed the part count is truncated with a warning rather than rejected.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One bounded chunk of a log response. Parts are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPart {
    pub log_id: String,
    pub part: usize,
    pub part_count: usize,
    pub data: Vec<u8>,
}

/// Splits `content` into at most `max_part_count` parts of at most
/// `max_part_size` bytes. Empty content yields one empty part so the
/// receiver still sees a response.
pub fn split_log(
    log_id: &str,
    content: &[u8],
    max_part_size: usize,
    max_part_count: usize,
) -> Vec<LogPart> {
    let max_part_size = max_part_size.max(1);
    let max_part_count = max_part_count.max(1);

    let mut chunks: Vec<&[u8]> = content.chunks(max_part_size).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    if chunks.len() > max_part_count {
        warn!(
            log_id,
            parts = chunks.len(),
            max_part_count,
            "log truncated to part limit"
        );
        chunks.truncate(max_part_count);
    }

    let part_count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| LogPart {
            log_id: log_id.to_string(),
            part: index + 1,
            part_count,
            data: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_bounded_parts() {
        let parts = split_log("log1", &[0u8; 10], 4, 80);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].part, 1);
        assert_eq!(parts[2].part, 3);
        assert!(parts.iter().all(|part| part.part_count == 3));
        assert_eq!(parts[0].data.len(), 4);
        assert_eq!(parts[2].data.len(), 2);
    }

    #[test]
    fn empty_content_yields_one_part() {
        let parts = split_log("log1", &[], 4, 80);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].data.is_empty());
        assert_eq!(parts[0].part_count, 1);
    }

    #[test]
    fn truncates_to_part_limit() {
        let parts = split_log("log1", &[0u8; 100], 10, 3);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|part| part.part_count == 3));
    }
}
