//! Data-plane command handlers.

use tokio_stream::StreamExt;

use dataspace_core::{PatchOutcome, Payload, QoS, split_jsonpath};

use crate::cli::{AtArgs, LinkArgs, LogAtArgs, PublishArgs, UrlArgs, WatchArgs};
use crate::error::CliError;
use crate::output;

use super::Ctx;

pub async fn get(ctx: &Ctx, args: &UrlArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    let delivery = ctx.hub.get(&url).await?.ok_or_else(|| CliError::NoValue {
        url: url.clone(),
        timeout: ctx.hub.config().get_timeout,
    })?;
    ctx.print(&output::render_delivery(ctx.output, &delivery)?);
    Ok(())
}

pub async fn publish(ctx: &Ctx, args: PublishArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    let payload = publish_payload(args.value, args.json)?;

    if let (base, Some(path)) = split_jsonpath(&url) {
        let pending = ctx.hub.patch(base, path, payload.into_value()).await?;
        return match pending.outcome().await {
            PatchOutcome::Applied => {
                ctx.note(&format!("Patched {path} of {base}"));
                Ok(())
            }
            PatchOutcome::Expired => Err(CliError::NoValue {
                url: base.to_owned(),
                timeout: ctx.hub.config().patch_timeout,
            }),
            PatchOutcome::Failed { reason } => Err(CliError::Decode {
                topic: base.to_owned(),
                reason,
            }),
        };
    }

    let qos = QoS::try_from(args.qos).map_err(|e| CliError::Validation {
        field: "qos".into(),
        reason: e.to_string(),
    })?;
    ctx.hub
        .publish_confirmed(&url, payload, qos, args.retain, ctx.hub.config().get_timeout)
        .await?;
    ctx.note(&format!("Published to {url}"));
    Ok(())
}

/// `--json` values are parsed; anything else is published, or set at a
/// JSON path, as a plain string.
fn publish_payload(value: String, json: bool) -> Result<Payload, CliError> {
    if json {
        Ok(Payload::Json(serde_json::from_str(&value)?))
    } else {
        Ok(Payload::Text(value))
    }
}

pub async fn ls(ctx: &Ctx, args: &UrlArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    let entries = ctx.hub.list(&url).await?.ok_or_else(|| CliError::NoValue {
        url: url.clone(),
        timeout: ctx.hub.config().get_timeout,
    })?;
    ctx.print(&output::render_entries(ctx.output, &entries)?);
    Ok(())
}

/// Print deliveries until interrupted or `--count` is reached.
pub async fn watch(ctx: &Ctx, args: &WatchArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    let mut stream = ctx.hub.subscribe_stream(&url).await?;
    let mut seen = 0usize;

    loop {
        tokio::select! {
            delivery = stream.next() => {
                let Some(delivery) = delivery else { break };
                ctx.print(&output::render_delivery(ctx.output, &delivery)?);
                seen += 1;
                if args.count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

pub async fn cached(ctx: &Ctx, args: &UrlArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    let cached = ctx
        .hub
        .get_cached(&url)
        .await?
        .ok_or_else(|| CliError::NotCached { url: url.clone() })?;
    ctx.print(&output::render_cached(ctx.output, &url, &cached)?);
    Ok(())
}

pub async fn log_at(ctx: &Ctx, args: &LogAtArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.at.url)?;
    let epoch = args.at.epoch;
    let bucket = ctx.hub.time_index_url(&url, epoch)?;
    let no_value = || CliError::NoValue {
        url: bucket.clone(),
        timeout: ctx.hub.config().get_timeout,
    };

    if args.records {
        let records = ctx
            .hub
            .get_records_at(&url, epoch)
            .await?
            .ok_or_else(no_value)?;
        ctx.print(&output::render_records(ctx.output, &records)?);
    } else {
        let delivery = ctx.hub.get_log_at(&url, epoch).await?.ok_or_else(no_value)?;
        ctx.print(&output::render_delivery(ctx.output, &delivery)?);
    }
    Ok(())
}

pub async fn files_at(ctx: &Ctx, args: &AtArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    let entries = ctx
        .hub
        .list_files_at(&url, args.epoch)
        .await?
        .ok_or_else(|| CliError::NoValue {
            url: url.clone(),
            timeout: ctx.hub.config().get_timeout,
        })?;
    ctx.print(&output::render_entries(ctx.output, &entries)?);
    Ok(())
}

pub async fn link(ctx: &Ctx, args: &LinkArgs) -> Result<(), CliError> {
    let url = ctx.url(&args.url)?;
    ctx.hub.link(&url, &args.target).await?;
    ctx.note(&format!("Link request sent for {url}"));
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn values_are_strings_unless_json() {
        let text = publish_payload("5".into(), false).unwrap();
        assert_eq!(text.into_value(), json!("5"));
        let parsed = publish_payload(r#"{"a":[1]}"#.into(), true).unwrap();
        assert_eq!(parsed.into_value(), json!({"a": [1]}));
    }

    #[test]
    fn invalid_json_is_a_usage_error() {
        let err = publish_payload("{".into(), true).unwrap_err();
        assert!(matches!(err, CliError::Json(_)));
    }
}
