// ============================================================
// Layer 4 — Feature Manifest Loader
// ============================================================
// Reads the output of the acoustic front-end from disk.
//
// Layout under the data directory:
//
//   <datadir>/
//     train-clean-100.jsonl
//     dev-clean.jsonl
//     ...
//
// One JSON object per line, one line per utterance:
//
//   {"id": "84-121123-0000",
//    "transcript": "GO DO YOU HEAR",
//    "features": [[c0, c1, ... c25], [c0, ...], ...]}
//
// `features` is the [frames, n_mfcc] MFCC matrix. Every row must
// have exactly n_mfcc values and every value must be finite;
// otherwise loading fails with the offending line number.
//
// Blank lines are skipped so manifests can be concatenated with
// `cat` without fuss.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::domain::{alphabet::VocabularyError, traits::UtteranceSource, utterance::Utterance};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read manifest '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: malformed manifest entry: {source}", .path.display())]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "{}:{line}: utterance '{id}' frame {frame} has {got} coefficients, expected {expected}",
        .path.display()
    )]
    FeatureDim {
        path:     PathBuf,
        line:     usize,
        id:       String,
        frame:    usize,
        got:      usize,
        expected: usize,
    },

    #[error("{}:{line}: utterance '{id}' contains a non-finite feature value", .path.display())]
    NonFinite { path: PathBuf, line: usize, id: String },

    #[error("{}:{line}: utterance '{id}' has no feature frames", .path.display())]
    Empty { path: PathBuf, line: usize, id: String },

    #[error("transcript of utterance '{id}' cannot be encoded: {source}")]
    Transcript {
        id: String,
        #[source]
        source: VocabularyError,
    },
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id:         String,
    transcript: String,
    features:   Vec<Vec<f32>>,
}

/// Loads `<dir>/<subset>.jsonl` feature manifests.
pub struct ManifestLoader {
    dir:    PathBuf,
    n_mfcc: usize,
}

impl ManifestLoader {
    pub fn new(dir: impl Into<PathBuf>, n_mfcc: usize) -> Self {
        Self { dir: dir.into(), n_mfcc }
    }

    pub fn manifest_path(&self, subset: &str) -> PathBuf {
        self.dir.join(format!("{subset}.jsonl"))
    }

    fn parse_line(&self, path: &Path, line_no: usize, line: &str) -> Result<Utterance, DatasetError> {
        let entry: ManifestEntry = serde_json::from_str(line).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            line: line_no,
            source,
        })?;

        if entry.features.is_empty() {
            return Err(DatasetError::Empty {
                path: path.to_path_buf(),
                line: line_no,
                id:   entry.id,
            });
        }

        let mut flat = Vec::with_capacity(entry.features.len() * self.n_mfcc);
        for (frame, row) in entry.features.iter().enumerate() {
            if row.len() != self.n_mfcc {
                return Err(DatasetError::FeatureDim {
                    path:     path.to_path_buf(),
                    line:     line_no,
                    id:       entry.id,
                    frame,
                    got:      row.len(),
                    expected: self.n_mfcc,
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(DatasetError::NonFinite {
                    path: path.to_path_buf(),
                    line: line_no,
                    id:   entry.id,
                });
            }
            flat.extend_from_slice(row);
        }

        Ok(Utterance::new(entry.id, entry.transcript, flat, self.n_mfcc))
    }
}

impl UtteranceSource for ManifestLoader {
    type Error = DatasetError;

    fn load_subset(&self, subset: &str) -> Result<Vec<Utterance>, DatasetError> {
        let path = self.manifest_path(subset);
        let io_err = |source| DatasetError::Io { path: path.clone(), source };

        let reader = BufReader::new(File::open(&path).map_err(io_err)?);
        let mut utterances = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            utterances.push(self.parse_line(&path, idx + 1, &line)?);
        }

        tracing::info!("Loaded {} utterances from '{}'", utterances.len(), path.display());
        Ok(utterances)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, subset: &str, body: &str) {
        let mut f = File::create(dir.join(format!("{subset}.jsonl"))).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_loads_and_flattens_features() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            tmp.path(),
            "dev-clean",
            "{\"id\":\"1-2-0\",\"transcript\":\"HI\",\"features\":[[1,2],[3,4],[5,6]]}\n\n",
        );
        let loader = ManifestLoader::new(tmp.path(), 2);
        let utts   = loader.load_subset("dev-clean").unwrap();
        assert_eq!(utts.len(), 1);
        assert_eq!(utts[0].frames(), 3);
        assert_eq!(utts[0].features, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concatenates_subsets_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "a", "{\"id\":\"a\",\"transcript\":\"x\",\"features\":[[0]]}\n");
        write_manifest(tmp.path(), "b", "{\"id\":\"b\",\"transcript\":\"y\",\"features\":[[0]]}\n");
        let loader = ManifestLoader::new(tmp.path(), 1);
        let utts   = loader.load_subsets(&["b".to_string(), "a".to_string()]).unwrap();
        let ids: Vec<_> = utts.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_feature_dim_mismatch_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            tmp.path(),
            "bad",
            "{\"id\":\"ok\",\"transcript\":\"x\",\"features\":[[0,0]]}\n\
             {\"id\":\"short\",\"transcript\":\"x\",\"features\":[[0,0],[0]]}\n",
        );
        let err = ManifestLoader::new(tmp.path(), 2).load_subset("bad").unwrap_err();
        match err {
            DatasetError::FeatureDim { line, frame, got, .. } => {
                assert_eq!((line, frame, got), (2, 1, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ManifestLoader::new(tmp.path(), 2).load_subset("nope").unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }

    #[test]
    fn test_empty_feature_matrix_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "e", "{\"id\":\"z\",\"transcript\":\"x\",\"features\":[]}\n");
        let err = ManifestLoader::new(tmp.path(), 2).load_subset("e").unwrap_err();
        assert!(matches!(err, DatasetError::Empty { .. }));
    }
}
