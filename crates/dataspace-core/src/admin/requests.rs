// ── Control-plane wire types ──
//
// Dynamic-security commands and responses. Commands are sent as
// `{"commands": [{"command": ..., "correlationData": ..., ...}]}` and
// answered on the response topic as `{"responses": [...]}`.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Command topic of the broker's dynamic-security plugin.
pub const CONTROL_TOPIC: &str = "$CONTROL/dynamic-security/v1";
/// Topic the plugin answers on.
pub const RESPONSE_TOPIC: &str = "$CONTROL/dynamic-security/v1/response";

// ── ACLs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum AclType {
    PublishClientSend,
    PublishClientReceive,
    SubscribeLiteral,
    SubscribePattern,
    UnsubscribeLiteral,
    UnsubscribePattern,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    #[serde(rename = "acltype")]
    pub acl_type: AclType,
    pub topic: String,
    pub allow: bool,
    pub priority: i32,
}

impl AclRule {
    pub fn allow(acl_type: AclType, topic: impl Into<String>) -> Self {
        Self {
            acl_type,
            topic: topic.into(),
            allow: true,
            priority: 1,
        }
    }
}

/// Read/write access to `namespace` (a `#`-terminated filter) and to
/// its private reply form.
pub fn namespace_acls(namespace: &str) -> Vec<AclRule> {
    let private = format!("$private/+/{namespace}");
    vec![
        AclRule::allow(AclType::PublishClientSend, namespace),
        AclRule::allow(AclType::PublishClientReceive, namespace),
        AclRule::allow(AclType::SubscribePattern, namespace),
        AclRule::allow(AclType::SubscribePattern, private.clone()),
        AclRule::allow(AclType::PublishClientReceive, private),
    ]
}

// ── Commands ─────────────────────────────────────────────────────────

/// One dynamic-security command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command")]
pub enum AdminCommand {
    #[serde(rename = "createRole")]
    CreateRole {
        #[serde(rename = "rolename")]
        role: String,
        #[serde(rename = "textname", skip_serializing_if = "Option::is_none")]
        text_name: Option<String>,
    },
    #[serde(rename = "addRoleACL")]
    AddRoleAcl {
        #[serde(rename = "rolename")]
        role: String,
        #[serde(rename = "acltype")]
        acl_type: AclType,
        topic: String,
        allow: bool,
        priority: i32,
    },
    #[serde(rename = "createClient")]
    CreateClient {
        username: String,
        #[serde(serialize_with = "expose_password")]
        password: SecretString,
        #[serde(rename = "textname", skip_serializing_if = "Option::is_none")]
        text_name: Option<String>,
    },
    #[serde(rename = "addClientRole")]
    AddClientRole {
        username: String,
        #[serde(rename = "rolename")]
        role: String,
        priority: i32,
    },
    #[serde(rename = "createGroup")]
    CreateGroup {
        #[serde(rename = "groupname")]
        group: String,
    },
    #[serde(rename = "addGroupClient")]
    AddGroupClient {
        #[serde(rename = "groupname")]
        group: String,
        username: String,
    },
    #[serde(rename = "addGroupRole")]
    AddGroupRole {
        #[serde(rename = "groupname")]
        group: String,
        #[serde(rename = "rolename")]
        role: String,
        priority: i32,
    },
}

impl AdminCommand {
    pub fn add_role_acl(role: impl Into<String>, rule: AclRule) -> Self {
        Self::AddRoleAcl {
            role: role.into(),
            acl_type: rule.acl_type,
            topic: rule.topic,
            allow: rule.allow,
            priority: rule.priority,
        }
    }

    /// Wire name, e.g. `createRole`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRole { .. } => "createRole",
            Self::AddRoleAcl { .. } => "addRoleACL",
            Self::CreateClient { .. } => "createClient",
            Self::AddClientRole { .. } => "addClientRole",
            Self::CreateGroup { .. } => "createGroup",
            Self::AddGroupClient { .. } => "addGroupClient",
            Self::AddGroupRole { .. } => "addGroupRole",
        }
    }
}

fn expose_password<S: Serializer>(password: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(password.expose_secret())
}

#[derive(Debug, Serialize)]
struct TaggedCommand<'a> {
    #[serde(flatten)]
    command: &'a AdminCommand,
    #[serde(rename = "correlationData")]
    correlation_data: &'a str,
}

#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    commands: [TaggedCommand<'a>; 1],
}

/// Serialize `command` as a single-command envelope.
pub fn encode_command(command: &AdminCommand, correlation_id: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&CommandEnvelope {
        commands: [TaggedCommand {
            command,
            correlation_data: correlation_id,
        }],
    })
}

// ── Responses ────────────────────────────────────────────────────────

/// One entry of a response envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdminResponse {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(rename = "correlationData", default)]
    pub correlation_data: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AdminResponse {
    /// Error text, if the broker reported one.
    pub fn error_text(&self) -> Option<String> {
        if let Some(message) = self.error_message.as_deref().filter(|m| !m.is_empty()) {
            return Some(message.to_owned());
        }
        match &self.error {
            None | Some(Value::Null | Value::Bool(false)) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    responses: Vec<Value>,
}

/// Decode a response envelope. Entries that are not objects are skipped.
pub fn decode_responses(payload: &[u8]) -> Result<Vec<AdminResponse>, serde_json::Error> {
    let envelope: ResponseEnvelope = serde_json::from_slice(payload)?;
    Ok(envelope
        .responses
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

/// An error that only says the object exists already.
pub fn is_already_exists(message: &str) -> bool {
    message.to_lowercase().contains("already")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn encoded(command: &AdminCommand) -> Value {
        serde_json::from_slice(&encode_command(command, "c-1").unwrap()).unwrap()
    }

    #[test]
    fn create_role_envelope() {
        let command = AdminCommand::CreateRole {
            role: "alice_role".into(),
            text_name: Some("Role for alice".into()),
        };
        assert_eq!(
            encoded(&command),
            json!({"commands": [{
                "command": "createRole",
                "correlationData": "c-1",
                "rolename": "alice_role",
                "textname": "Role for alice",
            }]})
        );
    }

    #[test]
    fn acl_command_fields() {
        let command = AdminCommand::add_role_acl("r", AclRule::allow(AclType::SubscribePattern, "a/#"));
        assert_eq!(
            encoded(&command)["commands"][0],
            json!({
                "command": "addRoleACL",
                "correlationData": "c-1",
                "rolename": "r",
                "acltype": "subscribePattern",
                "topic": "a/#",
                "allow": true,
                "priority": 1,
            })
        );
    }

    #[test]
    fn optional_text_name_is_omitted() {
        let command = AdminCommand::CreateClient {
            username: "bob".into(),
            password: SecretString::from("pw"),
            text_name: None,
        };
        let value = encoded(&command);
        assert!(value["commands"][0].get("textname").is_none());
        assert_eq!(value["commands"][0]["password"], "pw");
        assert!(!format!("{command:?}").contains("pw\""));
        assert_eq!(command.name(), "createClient");
    }

    #[test]
    fn namespace_acl_set() {
        let acls = namespace_acls("datadirectory/Groups/g/#");
        assert_eq!(acls.len(), 5);
        assert_eq!(acls[3].topic, "$private/+/datadirectory/Groups/g/#");
        assert!(acls.iter().all(|a| a.allow && a.priority == 1));
    }

    #[test]
    fn decodes_responses_and_errors() {
        let raw = br#"{"responses":[
            {"command":"createRole","correlationData":"a"},
            {"command":"createRole","correlationData":"b","error":"Role already exists"},
            42
        ]}"#;
        let responses = decode_responses(raw).unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].error_text(), None);
        assert_eq!(responses[1].error_text().as_deref(), Some("Role already exists"));
        assert!(is_already_exists("Role ALREADY exists"));
        assert!(!is_already_exists("Client not found"));
    }
}
