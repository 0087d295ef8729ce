// Wire format checks for callers of the RPC surface.

use relay_protocol::frames::{InboundFrame, ReqFrame, ResFrame};
use relay_protocol::messages::{ExecuteRequest, SetupRequest, SetupResponse, WaitResponse};
use relay_protocol::methods;

#[test]
fn req_frame_round_trip() {
    let json = r#"{"type":"req","id":"abc-123","method":"task.init","params":{"config":{"runner_type":"k8s"}}}"#;
    let frame: InboundFrame = serde_json::from_str(json).unwrap();
    assert_eq!(frame.frame_type, "req");

    let req = frame.as_req().unwrap();
    assert_eq!(req.method, methods::TASK_INIT);
    assert_eq!(req.id, "abc-123");

    let setup: SetupRequest = req.parse_params().unwrap();
    let config = setup.config.unwrap();
    assert_eq!(config.runner_type, "k8s");
    assert!(config.steps.is_empty());
}

#[test]
fn non_req_frames_are_not_requests() {
    let frame: InboundFrame = serde_json::from_str(r#"{"type":"event","event":"x"}"#).unwrap();
    assert!(frame.as_req().is_none());
}

#[test]
fn missing_params_decode_as_empty_message() {
    let req = ReqFrame {
        frame_type: "req".into(),
        id: "1".into(),
        method: methods::TASK_EXECUTE.into(),
        params: None,
    };
    let exec: ExecuteRequest = req.parse_params().unwrap();
    assert!(exec.infra_ref_id.is_none());
}

#[test]
fn malformed_params_are_invalid_argument() {
    let req = ReqFrame::new("1", methods::TASK_WAIT, serde_json::json!({"timeout_ms": "soon"}));
    let err = req
        .parse_params::<relay_protocol::messages::WaitRequest>()
        .unwrap_err();
    assert_eq!(err.code(), relay_core::error::code::INVALID_ARGUMENT);
}

#[test]
fn res_ok_serialization() {
    let res = ResFrame::ok(
        "req-1",
        SetupResponse {
            task_id: "t".into(),
            infra_id: "i".into(),
            step_task_ids: Default::default(),
        },
    );
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""type":"res""#));
    assert!(json.contains(r#""ok":true"#));
    assert!(json.contains(r#""infra_id":"i""#));
    // error field must be absent on success
    assert!(!json.contains(r#""error""#));
}

#[test]
fn res_err_serialization() {
    let res = ResFrame::err("req-2", "FAILED_PRECONDITION", "no eligible agent");
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""ok":false"#));
    assert!(json.contains(r#""FAILED_PRECONDITION""#));
    // payload must be absent on error
    assert!(!json.contains(r#""payload""#));
}

#[test]
fn wait_response_shape() {
    let res = WaitResponse {
        task_id: "t".into(),
        expired: true,
        response: serde_json::json!({"error_message": "timed out"}),
    };
    let v = serde_json::to_value(&res).unwrap();
    assert_eq!(v["expired"], true);
    assert_eq!(v["response"]["error_message"], "timed out");
}
