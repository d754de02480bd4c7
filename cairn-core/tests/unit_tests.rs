//! Unit tests for cairn-core

use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use cairn_core::{
    config::{Config, LogFormat, LogLevel},
    protocol::{decode, encode, DataResponse, ExceptionResponse, Request, Response, UniqueIdRequest},
    Error, ObjectKey, Operation, ResourceKey, TransactionId,
};

mod config_tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cairn.json");
        std::fs::write(
            &path,
            r#"{
                "session": { "continue_timeout": 20000, "max_chunk_items": 8 },
                "logging": { "level": "Debug", "format": "Json" }
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.session.continue_timeout, Duration::from_secs(20));
        assert_eq!(config.session.max_chunk_items, 8);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        // untouched sections keep defaults
        assert_eq!(config.log.file_name, "transactions.log");
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_defaults_roundtrip_through_json() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        let parsed = Config::from_json_str(&json).unwrap();
        assert_eq!(parsed.locks.acquire_timeout, Config::default().locks.acquire_timeout);
    }
}

mod protocol_tests {
    use super::*;

    #[test]
    fn test_unique_id_request_frame() {
        let request = Request::UniqueId(UniqueIdRequest::Generate {
            name: "orders".to_string(),
            count: 10,
        });
        let decoded: Request = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_object_chunk_frame() {
        let response = Response::Data(DataResponse::Objects(vec![(
            ObjectKey::new("accounts", "acct:1"),
            Bytes::from_static(b"1000"),
        )]));
        let decoded: Response = decode(&encode(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_garbage_frame_is_serialization_error() {
        let err = decode::<Request>(&[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_exception_context_survives() {
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let exc = ExceptionResponse::from_error(&io, vec!["applying txn-9".to_string()]);
        assert!(!exc.recoverable);
        let local = exc.into_error();
        let text = local.to_string();
        assert!(text.contains("disk full"));
        assert!(text.contains("applying txn-9"));
    }
}

mod type_tests {
    use super::*;

    #[test]
    fn test_operation_resource() {
        let op = Operation::Put {
            key: ObjectKey::new("accounts", "acct:2"),
            payload: Bytes::from_static(b"1100"),
        };
        assert_eq!(op.resource(), ResourceKey::object("accounts", "acct:2"));
        assert_eq!(TransactionId(4).to_string(), "txn-4");
    }
}
