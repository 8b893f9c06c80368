use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::remote::discuss::{
    self, CallSessionInfo, ChannelInfo, ChannelSummary, Membership, MembershipInfo, UserInfo,
};
use crate::remote::{CallType, RemoteModelClient, Transport};

/// What a test call should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPlan {
    pub channel_id: i64,
    pub call_type: CallType,
    /// Delete the channel's existing call sessions before opening a new one.
    pub clean_first: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub user: UserInfo,
    pub channel: ChannelInfo,
    pub member: Membership,
    pub cleaned: usize,
    pub session_id: i64,
    /// The session as read back right after creation; `None` if the read failed.
    pub session: Option<CallSessionInfo>,
    pub message_id: Option<i64>,
    /// The chat message is best-effort; its failure does not fail the call.
    pub message_error: Option<String>,
}

fn call_message(call_type: CallType, session_id: i64) -> String {
    let label = match call_type {
        CallType::Audio => "Audio",
        CallType::Video => "Video",
    };
    format!("📞 {label} call started from rtcprobe (session {session_id})")
}

/// Open a call session in a channel and announce it with a chat message.
///
/// The client must already be authenticated. Nothing is rolled back if a
/// later step fails: a membership created here stays.
pub async fn place_call<T: Transport>(
    client: &RemoteModelClient<T>,
    plan: CallPlan,
) -> Result<CallOutcome> {
    let user = discuss::current_user(client).await?;
    info!(user = %user.name, partner_id = user.partner_id, "Calling as");

    let channel = discuss::channel_info(client, plan.channel_id)
        .await?
        .ok_or(Error::ChannelNotFound(plan.channel_id))?;
    info!(channel = %channel.name, channel_type = %channel.channel_type, "Target channel");

    let cleaned = if plan.clean_first {
        let stale = discuss::find_call_sessions(client, Some(plan.channel_id)).await?;
        discuss::delete_call_sessions(client, &stale).await?
    } else {
        0
    };

    let member = discuss::ensure_member(client, plan.channel_id, user.partner_id).await?;

    let session_id = discuss::create_call_session(
        client,
        plan.channel_id,
        member.id,
        user.partner_id,
        plan.call_type,
    )
    .await?;

    let session = match discuss::read_call_session(client, session_id).await {
        Ok(Some(session)) => Some(session),
        Ok(None) => {
            warn!(session_id = session_id, "Created call session could not be read back");
            None
        }
        Err(e) => {
            warn!(session_id = session_id, error = %e, "Call session read-back failed");
            None
        }
    };

    let (message_id, message_error) = match discuss::post_message(
        client,
        plan.channel_id,
        &call_message(plan.call_type, session_id),
        "comment",
    )
    .await
    {
        Ok(id) => (Some(id), None),
        Err(e) => {
            warn!(error = %e, "Chat message failed");
            let detail = match &e {
                Error::Invocation(inner) => inner.fault_message().map(str::to_string),
                _ => None,
            };
            (None, Some(detail.unwrap_or_else(|| e.to_string())))
        }
    };

    Ok(CallOutcome {
        user,
        channel,
        member,
        cleaned,
        session_id,
        session,
        message_id,
        message_error,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEnd {
    Removed,
    /// Something else deleted the session first.
    AlreadyGone,
}

/// Close the call by deleting its session, unless it is already gone.
pub async fn end_call<T: Transport>(
    client: &RemoteModelClient<T>,
    session_id: i64,
) -> Result<CallEnd> {
    if !discuss::call_session_exists(client, session_id).await? {
        info!(session_id = session_id, "Call session already removed");
        return Ok(CallEnd::AlreadyGone);
    }
    discuss::delete_call_sessions(client, &[session_id]).await?;
    info!(session_id = session_id, "Call ended");
    Ok(CallEnd::Removed)
}

/// Which channels the user should see, two ways: from membership fold
/// states, and from the server's own `is_member` filter.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelVisibility {
    pub user: UserInfo,
    pub memberships: Vec<MembershipInfo>,
    /// Channel ids of memberships not folded `closed`.
    pub visible: Vec<i64>,
    /// Active channels among `visible`.
    pub channels: Vec<ChannelSummary>,
    pub by_type: BTreeMap<String, usize>,
    pub is_member: Vec<ChannelSummary>,
    pub only_in_memberships: Vec<i64>,
    pub only_in_is_member: Vec<i64>,
}

impl ChannelVisibility {
    pub fn consistent(&self) -> bool {
        self.only_in_memberships.is_empty() && self.only_in_is_member.is_empty()
    }
}

pub async fn channel_visibility<T: Transport>(
    client: &RemoteModelClient<T>,
) -> Result<ChannelVisibility> {
    let user = discuss::current_user(client).await?;
    let memberships = discuss::memberships(client, user.partner_id).await?;

    let visible: Vec<i64> = memberships
        .iter()
        .filter(|m| m.visible())
        .map(|m| m.channel_id)
        .collect();
    let channels = discuss::active_channels(client, &visible).await?;
    let is_member = discuss::member_channels(client).await?;

    let mut by_type = BTreeMap::new();
    for channel in &channels {
        *by_type.entry(channel.channel_type.clone()).or_insert(0) += 1;
    }

    let from_memberships: BTreeSet<i64> = visible.iter().copied().collect();
    let from_filter: BTreeSet<i64> = is_member.iter().map(|c| c.id).collect();

    Ok(ChannelVisibility {
        user,
        only_in_memberships: from_memberships.difference(&from_filter).copied().collect(),
        only_in_is_member: from_filter.difference(&from_memberships).copied().collect(),
        memberships,
        visible,
        channels,
        by_type,
        is_member,
    })
}
