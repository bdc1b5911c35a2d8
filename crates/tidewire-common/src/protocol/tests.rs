//! Tests for the protocol module
//!
//! These tests cover request id handling, frame classification and the
//! response constructors.

#[cfg(test)]
mod tests {
    use super::super::*;

    fn map(entries: Vec<(&str, rmpv::Value)>) -> rmpv::Value {
        rmpv::Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[test]
    fn test_request_id_from_value() {
        assert_eq!(
            RequestId::from_value(&rmpv::Value::from("abc")),
            Some(RequestId::Text("abc".into()))
        );
        assert_eq!(
            RequestId::from_value(&rmpv::Value::from(-4)),
            Some(RequestId::Number(-4))
        );
        assert_eq!(
            RequestId::from_value(&rmpv::Value::from(u64::MAX)),
            Some(RequestId::Unsigned(u64::MAX))
        );
        assert_eq!(
            RequestId::from_value(&rmpv::Value::F64(1.5)),
            Some(RequestId::Float(1.5))
        );
        assert_eq!(RequestId::from_value(&rmpv::Value::F64(f64::NAN)), None);
        assert_eq!(RequestId::from_value(&rmpv::Value::Boolean(true)), None);
        assert_eq!(RequestId::from_value(&rmpv::Value::Nil), None);
    }

    #[test]
    fn test_request_id_serde_untagged() {
        let ids: Vec<RequestId> = serde_json::from_str(r#"[1, "two"]"#).unwrap();
        assert_eq!(ids, vec![RequestId::Number(1), RequestId::Text("two".into())]);
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"[1,"two"]"#);
    }

    #[test]
    fn test_numeric_ids_keep_their_form() {
        let ids: Vec<RequestId> =
            serde_json::from_str(r#"[1.5, 18446744073709551615, -2]"#).unwrap();
        assert_eq!(
            ids,
            vec![
                RequestId::Float(1.5),
                RequestId::Unsigned(u64::MAX),
                RequestId::Number(-2)
            ]
        );
        assert_eq!(
            serde_json::to_string(&ids).unwrap(),
            "[1.5,18446744073709551615,-2]"
        );
        assert_eq!(RequestId::Float(1.5).to_json(), serde_json::json!(1.5));
        assert_ne!(RequestId::Float(1.0), RequestId::Number(1));
    }

    #[test]
    fn test_float_id_salvaged_from_frame() {
        let frame = Frame::from_value(&map(vec![
            ("id", rmpv::Value::F64(1.5)),
            ("method", "echo".into()),
        ]))
        .unwrap();
        assert_eq!(frame.ids(), vec![RequestId::Float(1.5)]);
    }

    #[test]
    fn test_parsed_request_defaults_args_to_nil() {
        let parsed = ParsedRequest::from_value(&map(vec![
            ("id", 1.into()),
            ("method", "ping".into()),
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            ParsedRequest::Valid(RpcRequest::new(1, "ping", rmpv::Value::Nil))
        );
    }

    #[test]
    fn test_parsed_request_invalid_method() {
        let parsed = ParsedRequest::from_value(&map(vec![
            ("id", "x".into()),
            ("method", 5.into()),
        ]))
        .unwrap();
        assert!(matches!(parsed, ParsedRequest::Invalid { ref id, .. } if *id == RequestId::from("x")));

        let parsed = ParsedRequest::from_value(&map(vec![
            ("id", "y".into()),
            ("method", "".into()),
        ]))
        .unwrap();
        assert!(matches!(parsed, ParsedRequest::Invalid { .. }));
    }

    #[test]
    fn test_parsed_request_without_id() {
        assert!(ParsedRequest::from_value(&map(vec![("method", "ping".into())])).is_none());
        assert!(ParsedRequest::from_value(&rmpv::Value::from("ping")).is_none());
    }

    #[test]
    fn test_frame_single_vs_batch() {
        let single = Frame::from_value(&map(vec![("id", 1.into()), ("method", "a".into())])).unwrap();
        assert!(!single.is_batch());
        assert_eq!(single.len(), 1);

        let batch = Frame::from_value(&rmpv::Value::Array(vec![
            map(vec![("id", 1.into()), ("method", "a".into())]),
            map(vec![("id", 2.into()), ("method", "b".into())]),
        ]))
        .unwrap();
        assert!(batch.is_batch());
        assert_eq!(batch.ids(), vec![RequestId::from(1), RequestId::from(2)]);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_batch_items_without_id_are_logged() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let batch = tracing::subscriber::with_default(subscriber, || {
            Frame::from_value(&rmpv::Value::Array(vec![
                map(vec![("id", 1.into()), ("method", "a".into())]),
                map(vec![("method", "b".into())]),
                rmpv::Value::from("junk"),
            ]))
            .unwrap()
        });
        assert_eq!(batch.ids(), vec![RequestId::from(1)]);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Dropped 2 of 3 batch items"), "{output}");
    }

    #[test]
    fn test_response_success() {
        let resp = RpcResponse::success(RequestId::from(123), "ok".into(), RpcStats::new(3, 10));
        assert!(resp.ok);
        assert_eq!(resp.result, Some(rmpv::Value::from("ok")));
        assert!(resp.error.is_none());
        assert_eq!(resp.stats.remaining_requests, 3);
    }

    #[test]
    fn test_response_error() {
        let resp = RpcResponse::error(RequestId::from(456), "something failed", RpcStats::unlimited());
        assert!(!resp.ok);
        assert_eq!(resp.error, Some("something failed".to_string()));
        assert!(resp.result.is_none());
        assert!(resp.stats.is_unlimited());
    }

    #[test]
    fn test_response_json_skips_absent_fields() {
        let resp = RpcResponse::error(RequestId::from("9"), "Request blocked", RpcStats::unlimited());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "9",
                "ok": false,
                "stats": {"remainingRequests": -1, "resetInSeconds": 0},
                "error": "Request blocked"
            })
        );
        assert_eq!(json, resp.to_json());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(TidewireError::RateLimited.to_string(), "Rate limit exceeded");
        assert_eq!(
            TidewireError::UnknownMethod("nope".into()).to_string(),
            "Unknown method nope"
        );
        assert_eq!(TidewireError::MiddlewareBlocked.to_string(), "Request blocked");
        assert_eq!(TidewireError::Handler("boom".into()).to_string(), "boom");
        assert!(TidewireError::Auth("expired".into()).is_connection_fatal());
        assert!(TidewireError::Capacity("1.2.3.4".into()).is_connection_fatal());
        assert!(!TidewireError::RateLimited.is_connection_fatal());
    }
}
