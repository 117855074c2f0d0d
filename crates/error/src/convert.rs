use crate::{ErrorCode, StrataError};

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::new(ErrorCode::Io, err.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<bincode::Error> for StrataError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => io.into(),
            other => StrataError::new(ErrorCode::SerializationFailed, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let io_err = std::io::Error::other("File error");
        let strata_err: StrataError = io_err.into();
        assert_eq!(strata_err.code, ErrorCode::Io);
        assert!(strata_err.message.contains("File error"));
    }

    #[test]
    fn test_bincode_error_mapping() {
        let truncated: &[u8] = &[1];
        let err = bincode::deserialize::<String>(truncated).unwrap_err();
        let strata_err: StrataError = err.into();
        assert!(matches!(
            strata_err.code,
            ErrorCode::SerializationFailed | ErrorCode::Io
        ));
    }
}
