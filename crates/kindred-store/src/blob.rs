//! f32 vector ↔ little-endian BLOB conversion for SQLite columns.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("vector blob length {0} is not a multiple of 4")]
pub(crate) struct BlobLengthError(pub usize);

pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub(crate) fn vector_from_blob(blob: &[u8]) -> Result<Vec<f32>, BlobLengthError> {
    if blob.len() % 4 != 0 {
        return Err(BlobLengthError(blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let vector = vec![1.0f32, -0.5, 0.0, 3.25e-4];
        assert_eq!(vector_from_blob(&vector_to_blob(&vector)).unwrap(), vector);
    }

    #[test]
    fn test_empty() {
        assert!(vector_from_blob(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_bad_length() {
        assert!(vector_from_blob(&[0u8; 5]).is_err());
    }
}
