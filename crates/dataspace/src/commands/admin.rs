//! Broker access-control command handlers.
//!
//! Server arguments are `host[:port]` or `mqtt[s]://host[:port]`.

use secrecy::SecretString;
use serde::Serialize;
use tabled::Tabled;

use crate::cli::{AdminArgs, AdminCommand};
use crate::error::CliError;
use crate::output;

use super::Ctx;

#[derive(Clone, Serialize, Tabled)]
struct Grant {
    #[tabled(rename = "Subject")]
    subject: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "ACLs")]
    acls: usize,
}

pub async fn handle(ctx: &Ctx, args: AdminArgs) -> Result<(), CliError> {
    match args.command {
        AdminCommand::EnsureGroup { server, group } => {
            let granted = ctx.hub.ensure_group_permissions(&server, &group).await?;
            print_grant(
                ctx,
                Grant {
                    subject: granted.group,
                    role: granted.role,
                    acls: granted.acls,
                },
            )
        }

        AdminCommand::AddUser {
            server,
            username,
            full_name,
            password_env,
        } => {
            let password = std::env::var(&password_env)
                .map(SecretString::from)
                .map_err(|_| CliError::Validation {
                    field: "password".into(),
                    reason: format!("set the new user's password in ${password_env}"),
                })?;
            let user = ctx
                .hub
                .add_user_with_role(&server, &username, &password, full_name.as_deref())
                .await?;
            if user.name_published {
                ctx.note(&format!("Display name published for {username}"));
            }
            print_grant(
                ctx,
                Grant {
                    subject: user.username,
                    role: user.role,
                    acls: user.acls,
                },
            )
        }

        AdminCommand::CreateRole {
            server,
            role,
            text_name,
        } => {
            let admin = ctx.hub.admin(&server).await?;
            admin.create_role(&role, text_name.as_deref()).await?;
            ctx.note(&format!("Role '{role}' ready"));
            Ok(())
        }

        AdminCommand::CreateGroup { server, group } => {
            let admin = ctx.hub.admin(&server).await?;
            admin.create_group(&group).await?;
            ctx.note(&format!("Group '{group}' ready"));
            Ok(())
        }

        AdminCommand::AddGroupClient {
            server,
            group,
            username,
        } => {
            let admin = ctx.hub.admin(&server).await?;
            admin.add_group_client(&group, &username).await?;
            ctx.note(&format!("'{username}' added to group '{group}'"));
            Ok(())
        }
    }
}

fn print_grant(ctx: &Ctx, grant: Grant) -> Result<(), CliError> {
    let rendered = output::render_list(ctx.output, &[grant], Clone::clone, |g| g.role.clone())?;
    ctx.print(&rendered);
    Ok(())
}
