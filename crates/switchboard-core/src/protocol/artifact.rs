use super::message::{push_part, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Artifact chunk violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArtifactError {
    /// Chunk arrived after the chunk marked `last_chunk`
    #[error("artifact '{0}' is already complete")]
    AlreadyComplete(String),

    /// Chunk sequence gap or repeat
    #[error("artifact '{artifact_id}' expected chunk {expected}, got {got}")]
    OutOfOrder {
        /// Artifact identifier
        artifact_id: String,
        /// Next valid sequence number
        expected: u64,
        /// Sequence number received
        got: u64,
    },
}

/// One streamed piece of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactChunk {
    /// Artifact identifier, unique within the task
    pub artifact_id: String,
    /// Artifact name (e.g. "answer", "tickets")
    pub name: String,
    /// Zero-based chunk sequence number
    pub seq: u64,
    /// Content of this chunk
    pub parts: Vec<Part>,
    /// Marks the final chunk
    #[serde(default)]
    pub last_chunk: bool,
}

/// An output object reassembled from its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier
    pub artifact_id: String,
    /// Artifact name
    pub name: String,
    /// Content with adjacent text merged
    pub parts: Vec<Part>,
    /// Whether the final chunk has been applied
    pub complete: bool,
    /// Number of chunks applied
    pub chunks: u64,
}

impl Artifact {
    /// Start an artifact from its first chunk.
    pub fn from_chunk(chunk: ArtifactChunk) -> Result<Self, ArtifactError> {
        let mut artifact = Self {
            artifact_id: chunk.artifact_id.clone(),
            name: chunk.name.clone(),
            parts: Vec::new(),
            complete: false,
            chunks: 0,
        };
        artifact.append(chunk)?;
        Ok(artifact)
    }

    /// Check that `chunk` may be applied next, without applying it.
    pub fn check(&self, chunk: &ArtifactChunk) -> Result<(), ArtifactError> {
        if self.complete {
            return Err(ArtifactError::AlreadyComplete(self.artifact_id.clone()));
        }
        if chunk.seq != self.chunks {
            return Err(ArtifactError::OutOfOrder {
                artifact_id: self.artifact_id.clone(),
                expected: self.chunks,
                got: chunk.seq,
            });
        }
        Ok(())
    }

    /// Apply the next chunk.
    pub fn append(&mut self, chunk: ArtifactChunk) -> Result<(), ArtifactError> {
        self.check(&chunk)?;
        for part in chunk.parts {
            push_part(&mut self.parts, part);
        }
        self.chunks += 1;
        self.complete = chunk.last_chunk;
        Ok(())
    }

    /// Concatenated text content.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u64, text: &str, last: bool) -> ArtifactChunk {
        ArtifactChunk {
            artifact_id: "a1".to_string(),
            name: "answer".to_string(),
            seq,
            parts: vec![Part::text(text)],
            last_chunk: last,
        }
    }

    fn chunked(content: &str, size: usize) -> Vec<ArtifactChunk> {
        let chars: Vec<char> = content.chars().collect();
        let pieces: Vec<String> = chars.chunks(size).map(|c| c.iter().collect()).collect();
        let n = pieces.len();
        pieces
            .iter()
            .enumerate()
            .map(|(i, p)| chunk(i as u64, p, i + 1 == n))
            .collect()
    }

    #[test]
    fn test_chunk_size_does_not_change_content() {
        let content = "| ticket | status |\n| OPS-1 | open |\n| OPS-7 | blocked — ü |";
        let mut rebuilt = Vec::new();
        for size in [1, 2, 3, 7, 16, content.len()] {
            let mut chunks = chunked(content, size).into_iter();
            let mut artifact = Artifact::from_chunk(chunks.next().unwrap()).unwrap();
            for c in chunks {
                artifact.append(c).unwrap();
            }
            assert!(artifact.complete);
            rebuilt.push(artifact.parts.clone());
        }
        assert!(rebuilt.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(rebuilt[0], vec![Part::text(content)]);
    }

    #[test]
    fn test_no_chunk_after_last() {
        let mut artifact = Artifact::from_chunk(chunk(0, "done", true)).unwrap();
        let err = artifact.append(chunk(1, "more", false)).unwrap_err();
        assert_eq!(err, ArtifactError::AlreadyComplete("a1".to_string()));
        assert_eq!(artifact.text(), "done");
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut artifact = Artifact::from_chunk(chunk(0, "a", false)).unwrap();
        let err = artifact.append(chunk(2, "c", false)).unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::OutOfOrder {
                expected: 1,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_first_chunk_must_be_zero() {
        assert!(Artifact::from_chunk(chunk(1, "late start", false)).is_err());
    }
}
