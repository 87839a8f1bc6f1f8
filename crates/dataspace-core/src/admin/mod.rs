// ── Control-plane client ──
//
// Request/response over the broker's dynamic-security topics. Every
// command carries a fresh correlation id, registered before the command
// is published; one shared listener per connection resolves replies.
// Replies reporting that the object exists already count as success, so
// every provisioning step can be retried.

pub mod requests;

use std::time::Duration;

use bytes::Bytes;
use dataspace_api::QoS;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::correlation::PendingRequests;
use crate::error::CoreError;
use crate::payload::{Delivery, Handler};

pub use requests::{
    AclRule, AclType, AdminCommand, AdminResponse, CONTROL_TOPIC, RESPONSE_TOPIC, namespace_acls,
};

use requests::{decode_responses, encode_command, is_already_exists};

/// Result of [`AdminClient::ensure_group_permissions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupPermissions {
    pub group: String,
    pub role: String,
    /// Number of ACL rules ensured on the role.
    pub acls: usize,
}

/// Result of [`AdminClient::provision_user`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedUser {
    pub username: String,
    pub role: String,
    pub acls: usize,
    /// Whether the display name was published to the user's directory.
    pub name_published: bool,
}

/// Listener that resolves outstanding commands from response envelopes.
pub(crate) fn reply_listener(pending: PendingRequests<AdminResponse>) -> Handler {
    Handler::new(move |delivery: &Delivery| {
        let Some(bytes) = delivery.payload.as_bytes() else {
            return;
        };
        match decode_responses(bytes) {
            Ok(responses) => {
                for response in responses {
                    if let Some(id) = response.correlation_data.clone() {
                        pending.resolve(&id, response);
                    }
                }
            }
            Err(e) => warn!(topic = %delivery.topic, error = %e, "undecodable control-plane reply"),
        }
    })
}

/// Dynamic-security client bound to one connection.
///
/// Obtain one with [`Connection::admin`] or
/// [`DataHub::admin`](crate::DataHub::admin).
#[derive(Clone)]
pub struct AdminClient {
    connection: Connection,
    pending: PendingRequests<AdminResponse>,
    timeout: Duration,
}

impl AdminClient {
    pub(crate) fn new(connection: Connection, pending: PendingRequests<AdminResponse>) -> Self {
        let timeout = connection.config().admin_timeout;
        Self {
            connection,
            pending,
            timeout,
        }
    }

    /// Use `timeout` for every command instead of the configured default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one command and wait for its reply.
    ///
    /// No reply within the timeout is an error. An error reply is an
    /// error unless it says the object already exists.
    pub async fn send(&self, command: AdminCommand) -> Result<AdminResponse, CoreError> {
        let name = command.name();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let reply = self.pending.register(correlation_id.clone());

        let body = encode_command(&command, &correlation_id)
            .map_err(|e| CoreError::Internal(format!("encoding {name}: {e}")))?;
        self.connection
            .publish_confirmed(CONTROL_TOPIC, Bytes::from(body), QoS::AtLeastOnce, false, self.timeout)
            .await?;
        debug!(command = name, correlation_id = %correlation_id, "control-plane command sent");

        let response = reply
            .wait(self.timeout)
            .await
            .ok_or_else(|| CoreError::timeout(format!("control-plane command {name}"), self.timeout))?;

        if let Some(message) = response.error_text() {
            if is_already_exists(&message) {
                debug!(command = name, %message, "already present");
            } else {
                return Err(CoreError::Rejected {
                    command: name.to_owned(),
                    message,
                });
            }
        }
        Ok(response)
    }

    // ── Primitives ───────────────────────────────────────────────────

    pub async fn create_role(&self, role: &str, text_name: Option<&str>) -> Result<(), CoreError> {
        self.send(AdminCommand::CreateRole {
            role: role.to_owned(),
            text_name: text_name.map(str::to_owned),
        })
        .await
        .map(drop)
    }

    pub async fn add_role_acl(&self, role: &str, rule: &AclRule) -> Result<(), CoreError> {
        self.send(AdminCommand::add_role_acl(role, rule.clone()))
            .await
            .map(drop)
    }

    pub async fn create_client(
        &self,
        username: &str,
        password: &SecretString,
        text_name: Option<&str>,
    ) -> Result<(), CoreError> {
        self.send(AdminCommand::CreateClient {
            username: username.to_owned(),
            password: password.clone(),
            text_name: text_name.map(str::to_owned),
        })
        .await
        .map(drop)
    }

    pub async fn add_client_role(&self, username: &str, role: &str, priority: i32) -> Result<(), CoreError> {
        self.send(AdminCommand::AddClientRole {
            username: username.to_owned(),
            role: role.to_owned(),
            priority,
        })
        .await
        .map(drop)
    }

    pub async fn create_group(&self, group: &str) -> Result<(), CoreError> {
        self.send(AdminCommand::CreateGroup {
            group: group.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn add_group_client(&self, group: &str, username: &str) -> Result<(), CoreError> {
        self.send(AdminCommand::AddGroupClient {
            group: group.to_owned(),
            username: username.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn add_group_role(&self, group: &str, role: &str, priority: i32) -> Result<(), CoreError> {
        self.send(AdminCommand::AddGroupRole {
            group: group.to_owned(),
            role: role.to_owned(),
            priority,
        })
        .await
        .map(drop)
    }

    // ── Composites ───────────────────────────────────────────────────

    /// Role `group_<group>_role` with read/write access to the group's
    /// namespace, bound to the group.
    pub async fn ensure_group_permissions(&self, group: &str) -> Result<GroupPermissions, CoreError> {
        let role = format!("group_{group}_role");
        let namespace = format!("{}/Groups/{group}/#", self.connection.config().base_path);

        self.create_role(&role, Some(&format!("Role for group {group}")))
            .await?;
        let acls = namespace_acls(&namespace);
        for rule in &acls {
            self.add_role_acl(&role, rule).await?;
        }
        self.add_group_role(group, &role, 1).await?;

        info!(group, role = %role, "group permissions ensured");
        Ok(GroupPermissions {
            group: group.to_owned(),
            role,
            acls: acls.len(),
        })
    }

    /// Create `username` with a personal role over its user directory.
    /// With a full name, the name is published to `<base>/Users/<user>/name`.
    pub async fn provision_user(
        &self,
        username: &str,
        password: &SecretString,
        full_name: Option<&str>,
    ) -> Result<ProvisionedUser, CoreError> {
        let base = &self.connection.config().base_path;
        let role = format!("{username}_role");
        let namespace = format!("{base}/Users/{username}/#");

        self.create_role(&role, Some(&format!("Role for {username}")))
            .await?;
        let acls = namespace_acls(&namespace);
        for rule in &acls {
            self.add_role_acl(&role, rule).await?;
        }

        self.create_client(username, password, Some(full_name.unwrap_or(username)))
            .await?;
        self.add_client_role(username, &role, 1).await?;

        let name_published = match full_name {
            Some(full_name) => {
                let topic = format!("{base}/Users/{username}/name");
                let body = serde_json::json!({ "default": full_name }).to_string();
                self.connection
                    .publish_confirmed(&topic, Bytes::from(body), QoS::AtLeastOnce, false, self.timeout)
                    .await?;
                true
            }
            None => false,
        };

        info!(username, role = %role, "user provisioned");
        Ok(ProvisionedUser {
            username: username.to_owned(),
            role,
            acls: acls.len(),
            name_published,
        })
    }
}
