//! Request and response messages exchanged over the daemon socket.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use grove_types::InstanceState;

/// The request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Ping,
    Start,
    List,
    Attach,
    Logs,
    LogsFollow,
    Stop,
    Restart,
    Drop,
    Finish,
    Check,
}

/// A single request from a grove client.
///
/// Only the fields relevant to the verb are set; the rest serialize as
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, rename = "instanceID", skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    /// Extra environment for the agent process; overrides the data root's
    /// `env` file.
    #[serde(default, rename = "agentEnv", skip_serializing_if = "HashMap::is_empty")]
    pub agent_env: HashMap<String, String>,
}

impl Request {
    /// A request with no arguments.
    pub fn new(kind: RequestType) -> Self {
        Self {
            kind,
            project: String::new(),
            branch: String::new(),
            instance_id: String::new(),
            agent_env: HashMap::new(),
        }
    }

    /// A request targeting one instance.
    pub fn for_instance(kind: RequestType, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::new(kind)
        }
    }
}

/// Public summary of one instance, also used as its persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, rename = "worktreeDir")]
    pub worktree_dir: String,
    #[serde(default, rename = "containerID")]
    pub container_id: String,
    #[serde(default, rename = "composeProject", skip_serializing_if = "String::is_empty")]
    pub compose_project: String,
    /// Creation time, epoch seconds.
    #[serde(default, rename = "createdAt")]
    pub created_at: i64,
    /// End time, epoch seconds; 0 while the instance has not ended.
    #[serde(default, rename = "endedAt")]
    pub ended_at: i64,
    pub state: InstanceState,
}

/// The single JSON response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, rename = "instanceID", skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceInfo>,
    /// On a missing-`grove.yaml` start failure: the main checkout path the
    /// client should point the user at.
    #[serde(default, rename = "initPath", skip_serializing_if = "String::is_empty")]
    pub init_path: String,
    #[serde(default, rename = "worktreeDir", skip_serializing_if = "String::is_empty")]
    pub worktree_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

impl Response {
    /// A bare success.
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: String::new(),
            instance_id: String::new(),
            instances: Vec::new(),
            init_path: String::new(),
            worktree_dir: String::new(),
            branch: String::new(),
        }
    }

    /// A one-line failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: message.into(),
            ..Self::ok()
        }
    }

    /// Success carrying an instance ID.
    pub fn with_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_wire_tags() {
        let tags = [
            (RequestType::Ping, "PING"),
            (RequestType::Start, "START"),
            (RequestType::List, "LIST"),
            (RequestType::Attach, "ATTACH"),
            (RequestType::Logs, "LOGS"),
            (RequestType::LogsFollow, "LOGS_FOLLOW"),
            (RequestType::Stop, "STOP"),
            (RequestType::Restart, "RESTART"),
            (RequestType::Drop, "DROP"),
            (RequestType::Finish, "FINISH"),
            (RequestType::Check, "CHECK"),
        ];
        for (kind, tag) in tags {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{tag}\""));
            let back: RequestType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn request_omits_empty_fields() {
        let req = Request::new(RequestType::List);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"LIST"}"#);
    }

    #[test]
    fn request_round_trip_with_env() {
        let mut req = Request::new(RequestType::Start);
        req.project = "api".into();
        req.branch = "fix-login".into();
        req.agent_env.insert("ANTHROPIC_API_KEY".into(), "sk".into());

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"agentEnv\""));
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project, "api");
        assert_eq!(back.agent_env["ANTHROPIC_API_KEY"], "sk");
    }

    #[test]
    fn unknown_request_tag_fails() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"EXPLODE"}"#).is_err());
    }

    #[test]
    fn instance_info_record_round_trip() {
        let info = InstanceInfo {
            id: "1".into(),
            project: "api".into(),
            branch: "fix-login".into(),
            worktree_dir: "/data/projects/api/worktrees/1".into(),
            container_id: "grove-1".into(),
            compose_project: String::new(),
            created_at: 1_700_000_000,
            ended_at: 0,
            state: InstanceState::Running,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"worktreeDir\""));
        assert!(!json.contains("composeProject"), "empty compose is omitted");
        let back: InstanceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.ended_at, 0);
    }

    #[test]
    fn response_error_shape() {
        let resp = Response::error("instance not found: z");
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"instance not found: z"}"#);
    }
}
