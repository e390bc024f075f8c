use std::path::{Path, PathBuf};

use crate::mr::error::CoordinatorError;

/// Everything the coordinator needs to know about the job, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Input splits, one map task each, in this order
    pub splits: Vec<String>,
    pub map_function: String,
    pub reduce_function: String,
    /// Number of reduce partitions
    pub reduce_n: usize,
}

impl Job {
    pub fn new(
        splits: Vec<String>,
        map_function: impl Into<String>,
        reduce_function: impl Into<String>,
        reduce_n: usize,
    ) -> Result<Self, CoordinatorError> {
        if reduce_n == 0 {
            return Err(CoordinatorError::InvalidJob(
                "the number of reduce tasks must be positive".to_string(),
            ));
        }
        Ok(Self {
            splits,
            map_function: map_function.into(),
            reduce_function: reduce_function.into(),
            reduce_n,
        })
    }
}

/// Turn command line inputs into input splits.
/// Files are taken as they are, directories contribute their `.txt` files in name order.
pub async fn collect_splits(inputs: &[PathBuf]) -> Result<Vec<String>, CoordinatorError> {
    let mut splits = Vec::new();
    for input in inputs {
        if tokio::fs::metadata(input).await?.is_dir() {
            splits.extend(txt_files(input).await?);
        } else {
            splits.push(input.to_string_lossy().into_owned());
        }
    }
    Ok(splits)
}

async fn txt_files(dir: &Path) -> Result<Vec<String>, CoordinatorError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("txt") {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_count_must_be_positive() {
        let err = Job::new(vec![], "word_count", "sum", 0).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidJob(_)));
        assert!(Job::new(vec![], "word_count", "sum", 1).is_ok());
    }

    #[tokio::test]
    async fn directories_expand_to_sorted_txt_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "notes.md"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let single = dir.path().join("notes.md");

        let splits = collect_splits(&[dir.path().to_path_buf(), single.clone()]).await.unwrap();

        assert_eq!(
            splits,
            vec![
                dir.path().join("a.txt").to_string_lossy().into_owned(),
                dir.path().join("b.txt").to_string_lossy().into_owned(),
                single.to_string_lossy().into_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_inputs_are_errors() {
        let err = collect_splits(&[PathBuf::from("/definitely/not/here")]).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Io(_)));
    }
}
