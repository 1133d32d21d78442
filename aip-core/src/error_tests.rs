/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::AipError;
    use crate::ProcessId;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_aip_error_display() {
        let error = AipError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = AipError::configuration("Folder 'inbox' is not configured.");
        assert_eq!(
            error.to_string(),
            "Configuration error: Folder 'inbox' is not configured."
        );

        let error = AipError::Storage("test storage error".to_string());
        assert_eq!(error.to_string(), "Storage error: test storage error");
    }

    #[test]
    fn test_aip_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let aip_error = AipError::from(io_error);

        match aip_error {
            AipError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_aip_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let aip_error = AipError::from(json_error);

        match aip_error {
            AipError::Json(_) => {}
            _ => panic!("Expected Json error variant"),
        }
    }

    #[test]
    fn test_timeout_classification() {
        assert!(AipError::timeout("queue empty").is_timeout());
        assert!(AipError::from(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_timeout());
        assert!(!AipError::record("oh-oh").is_timeout());
        assert!(!AipError::from(io::Error::new(io::ErrorKind::NotFound, "gone")).is_timeout());
    }

    #[test]
    fn test_lock_timeout_error() {
        let error = AipError::LockTimeout {
            name: "aip-7".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(error.to_string().contains("aip-7"));
    }

    #[test]
    fn test_restore_error_names_process() {
        let id = ProcessId::new(42).unwrap();
        let error = AipError::restore(id, "corrupt state blob");
        assert_eq!(
            error.to_string(),
            "Error while loading process [42]: corrupt state blob"
        );
    }

    #[test]
    fn test_aborted_error_keeps_message() {
        let error = AipError::Aborted {
            source_uri: "/tmp/in.csv".to_string(),
            message: "oh-oh".to_string(),
        };
        assert!(error.to_string().contains("oh-oh"));
        assert!(error.to_string().contains("/tmp/in.csv"));
    }

    #[test]
    fn test_integrity_check_failed_error() {
        let error = AipError::IntegrityCheckFailed {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };

        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<AipError>();
        assert_sync::<AipError>();
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(AipError::validation("test error"))
        }

        assert!(returns_error().is_err());
    }
}
