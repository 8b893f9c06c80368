//! Typed operations on the discuss models, one pinned remote method each.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::client::RemoteModelClient;
use super::transport::Transport;
use crate::error::{Error, InvocationError, Result};
use crate::xmlrpc::Value;

pub const USERS: &str = "res.users";
pub const CHANNELS: &str = "discuss.channel";
pub const MEMBERS: &str = "discuss.channel.member";
pub const CALL_SESSIONS: &str = "discuss.channel.rtc.session";
pub const CONFIG_PARAMETERS: &str = "ir.config_parameter";

/// `_`-separated name tokens that mark a session field as carrying signaling data.
const SIGNALING_MARKERS: &[&str] = &["sdp", "ice", "webrtc", "offer", "answer"];

const SESSION_FIELDS: &[&str] = &[
    "id",
    "channel_id",
    "partner_id",
    "channel_member_id",
    "is_camera_on",
    "is_muted",
    "create_date",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(format!("unknown call type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    pub uid: i64,
    pub name: String,
    pub email: Option<String>,
    pub partner_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub id: i64,
    pub name: String,
    pub channel_type: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub id: i64,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MembershipInfo {
    pub id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub fold_state: Option<String>,
}

impl MembershipInfo {
    /// The web client hides channels whose membership is folded `closed`.
    pub fn visible(&self) -> bool {
        self.fold_state.as_deref() != Some("closed")
    }
}

/// Channel row as returned by `search_read`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub id: i64,
    pub name: String,
    pub channel_type: String,
    pub member_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSessionInfo {
    pub id: i64,
    pub channel: Option<(i64, String)>,
    pub partner: Option<(i64, String)>,
    pub member: Option<(i64, String)>,
    pub is_camera_on: bool,
    pub is_muted: bool,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigParameter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: String,
    pub label: String,
    pub signaling: bool,
}

fn kwargs(value: serde_json::Value) -> BTreeMap<String, Value> {
    Value::from(value).into_struct().unwrap_or_default()
}

fn unexpected(model: &str, method: &str, detail: impl Into<String>) -> Error {
    Error::UnexpectedResult {
        model: model.to_string(),
        method: method.to_string(),
        detail: detail.into(),
    }
}

fn rows<'a>(value: &'a Value, model: &str, method: &str) -> Result<&'a [Value]> {
    value
        .as_array()
        .ok_or_else(|| unexpected(model, method, format!("expected a list, got {value:?}")))
}

/// `create` and `@returns` methods answer with an id, or a one-element id list.
fn record_id(value: &Value, model: &str, method: &str) -> Result<i64> {
    match value {
        Value::Int(id) => Ok(*id),
        Value::Array(items) => match items.as_slice() {
            [Value::Int(id)] => Ok(*id),
            _ => Err(unexpected(model, method, format!("expected one id, got {value:?}"))),
        },
        other => Err(unexpected(model, method, format!("expected an id, got {other:?}"))),
    }
}

fn id_list(value: &Value, model: &str, method: &str) -> Result<Vec<i64>> {
    rows(value, model, method)?
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| unexpected(model, method, format!("non-integer id {v:?}")))
        })
        .collect()
}

fn text(row: &Value, field: &str) -> String {
    row.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn flag(row: &Value, field: &str) -> bool {
    row.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn many2one(row: &Value, field: &str) -> Option<(i64, String)> {
    row.get(field)
        .and_then(Value::as_many2one)
        .map(|(id, name)| (id, name.to_string()))
}

fn is_signaling(name: &str) -> bool {
    name.to_lowercase()
        .split('_')
        .any(|token| SIGNALING_MARKERS.contains(&token))
}

fn required_id(row: &Value, model: &str, method: &str) -> Result<i64> {
    row.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| unexpected(model, method, format!("row without id: {row:?}")))
}

fn session_from_row(row: &Value, method: &str) -> Result<CallSessionInfo> {
    Ok(CallSessionInfo {
        id: required_id(row, CALL_SESSIONS, method)?,
        channel: many2one(row, "channel_id"),
        partner: many2one(row, "partner_id"),
        member: many2one(row, "channel_member_id"),
        is_camera_on: flag(row, "is_camera_on"),
        is_muted: flag(row, "is_muted"),
        created_at: row
            .get("create_date")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn channel_from_row(row: &Value, method: &str) -> Result<ChannelSummary> {
    Ok(ChannelSummary {
        id: required_id(row, CHANNELS, method)?,
        name: text(row, "name"),
        channel_type: text(row, "channel_type"),
        member_count: row.get("member_count").and_then(Value::as_i64),
    })
}

fn session_domain(channel_id: Option<i64>) -> Value {
    match channel_id {
        Some(id) => Value::from(json!([["channel_id", "=", id]])),
        None => Value::Array(Vec::new()),
    }
}

/// The authenticated user and their partner record.
pub async fn current_user<T: Transport>(client: &RemoteModelClient<T>) -> Result<UserInfo> {
    let uid = client
        .session()
        .ok_or(InvocationError::NotAuthenticated)?
        .uid();

    let result = client
        .invoke(
            USERS,
            "read",
            vec![Value::Int(uid)],
            kwargs(json!({"fields": ["name", "email", "partner_id"]})),
        )
        .await?;

    let row = rows(&result, USERS, "read")?
        .first()
        .ok_or_else(|| unexpected(USERS, "read", format!("no record for user {uid}")))?;
    let (partner_id, _) = many2one(row, "partner_id")
        .ok_or_else(|| unexpected(USERS, "read", "user has no partner"))?;

    Ok(UserInfo {
        uid,
        name: text(row, "name"),
        email: row.get("email").and_then(Value::as_str).map(str::to_string),
        partner_id,
    })
}

/// Channel header, or `None` when the read comes back empty.
pub async fn channel_info<T: Transport>(
    client: &RemoteModelClient<T>,
    channel_id: i64,
) -> Result<Option<ChannelInfo>> {
    let result = client
        .invoke(
            CHANNELS,
            "read",
            vec![Value::Int(channel_id)],
            kwargs(json!({"fields": ["name", "channel_type", "channel_member_ids"]})),
        )
        .await?;

    Ok(rows(&result, CHANNELS, "read")?.first().map(|row| ChannelInfo {
        id: row.get("id").and_then(Value::as_i64).unwrap_or(channel_id),
        name: text(row, "name"),
        channel_type: text(row, "channel_type"),
        member_count: row
            .get("channel_member_ids")
            .and_then(Value::as_array)
            .map_or(0, <[Value]>::len),
    }))
}

/// Membership of `partner_id` in `channel_id`, created if absent.
///
/// This is check-then-act: two callers racing on the same pair can both see
/// no membership and both create one. Only a unique constraint on the server
/// closes that window.
pub async fn ensure_member<T: Transport>(
    client: &RemoteModelClient<T>,
    channel_id: i64,
    partner_id: i64,
) -> Result<Membership> {
    let existing = client
        .invoke(
            MEMBERS,
            "search_read",
            vec![Value::from(json!([
                ["channel_id", "=", channel_id],
                ["partner_id", "=", partner_id]
            ]))],
            kwargs(json!({"fields": ["id"], "limit": 1})),
        )
        .await?;

    if let Some(id) = rows(&existing, MEMBERS, "search_read")?
        .first()
        .and_then(|row| row.get("id"))
        .and_then(Value::as_i64)
    {
        debug!(member_id = id, channel_id = channel_id, "Membership exists");
        return Ok(Membership { id, created: false });
    }

    let created = client
        .invoke(
            MEMBERS,
            "create",
            vec![Value::from(json!({
                "channel_id": channel_id,
                "partner_id": partner_id
            }))],
            BTreeMap::new(),
        )
        .await?;
    let id = record_id(&created, MEMBERS, "create")?;
    info!(member_id = id, channel_id = channel_id, "Membership created");
    Ok(Membership { id, created: true })
}

/// All memberships of a partner, with each channel's fold state.
pub async fn memberships<T: Transport>(
    client: &RemoteModelClient<T>,
    partner_id: i64,
) -> Result<Vec<MembershipInfo>> {
    let result = client
        .invoke(
            MEMBERS,
            "search_read",
            vec![Value::from(json!([["partner_id", "=", partner_id]]))],
            kwargs(json!({"fields": ["id", "channel_id", "fold_state"]})),
        )
        .await?;

    rows(&result, MEMBERS, "search_read")?
        .iter()
        .map(|row| -> Result<MembershipInfo> {
            let (channel_id, channel_name) = many2one(row, "channel_id")
                .ok_or_else(|| unexpected(MEMBERS, "search_read", "membership without channel"))?;
            Ok(MembershipInfo {
                id: required_id(row, MEMBERS, "search_read")?,
                channel_id,
                channel_name,
                fold_state: row
                    .get("fold_state")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

/// Open a call session for `member_id` in the channel. Returns the session id.
pub async fn create_call_session<T: Transport>(
    client: &RemoteModelClient<T>,
    channel_id: i64,
    member_id: i64,
    partner_id: i64,
    call_type: CallType,
) -> Result<i64> {
    let result = client
        .invoke(
            CALL_SESSIONS,
            "create",
            vec![Value::from(json!({
                "channel_id": channel_id,
                "channel_member_id": member_id,
                "partner_id": partner_id,
                "is_camera_on": call_type == CallType::Video,
                "is_muted": false,
                "is_screen_sharing_on": false,
                "is_deaf": false
            }))],
            BTreeMap::new(),
        )
        .await?;
    let id = record_id(&result, CALL_SESSIONS, "create")?;
    info!(session_id = id, channel_id = channel_id, call_type = %call_type, "Call session created");
    Ok(id)
}

/// Post a chat message in the channel. Returns the message id.
pub async fn post_message<T: Transport>(
    client: &RemoteModelClient<T>,
    channel_id: i64,
    body: &str,
    message_type: &str,
) -> Result<i64> {
    let result = client
        .invoke(
            CHANNELS,
            "message_post",
            vec![Value::Int(channel_id)],
            kwargs(json!({"body": body, "message_type": message_type})),
        )
        .await?;
    record_id(&result, CHANNELS, "message_post")
}

/// Ids of call sessions, optionally restricted to one channel.
pub async fn find_call_sessions<T: Transport>(
    client: &RemoteModelClient<T>,
    channel_id: Option<i64>,
) -> Result<Vec<i64>> {
    let result = client
        .invoke(
            CALL_SESSIONS,
            "search",
            vec![session_domain(channel_id)],
            BTreeMap::new(),
        )
        .await?;
    id_list(&result, CALL_SESSIONS, "search")
}

pub async fn list_call_sessions<T: Transport>(
    client: &RemoteModelClient<T>,
    channel_id: Option<i64>,
) -> Result<Vec<CallSessionInfo>> {
    let result = client
        .invoke(
            CALL_SESSIONS,
            "search_read",
            vec![session_domain(channel_id)],
            kwargs(json!({"fields": SESSION_FIELDS})),
        )
        .await?;

    rows(&result, CALL_SESSIONS, "search_read")?
        .iter()
        .map(|row| session_from_row(row, "search_read"))
        .collect()
}

/// Read one call session back, `None` when the read comes back empty.
pub async fn read_call_session<T: Transport>(
    client: &RemoteModelClient<T>,
    session_id: i64,
) -> Result<Option<CallSessionInfo>> {
    let result = client
        .invoke(
            CALL_SESSIONS,
            "read",
            vec![Value::Int(session_id)],
            kwargs(json!({"fields": SESSION_FIELDS})),
        )
        .await?;

    rows(&result, CALL_SESSIONS, "read")?
        .first()
        .map(|row| session_from_row(row, "read"))
        .transpose()
}

/// Whether the call session still exists on the server.
pub async fn call_session_exists<T: Transport>(
    client: &RemoteModelClient<T>,
    session_id: i64,
) -> Result<bool> {
    let result = client
        .invoke(
            CALL_SESSIONS,
            "search",
            vec![Value::from(json!([["id", "=", session_id]]))],
            BTreeMap::new(),
        )
        .await?;
    Ok(!id_list(&result, CALL_SESSIONS, "search")?.is_empty())
}

/// Delete the given call sessions. An empty list is a no-op.
pub async fn delete_call_sessions<T: Transport>(
    client: &RemoteModelClient<T>,
    ids: &[i64],
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let result = client
        .invoke(
            CALL_SESSIONS,
            "unlink",
            vec![Value::from(ids.to_vec())],
            BTreeMap::new(),
        )
        .await?;

    match result {
        Value::Bool(true) => {
            info!(count = ids.len(), "Call sessions deleted");
            Ok(ids.len())
        }
        other => Err(unexpected(CALL_SESSIONS, "unlink", format!("got {other:?}"))),
    }
}

/// Active channels among `ids`. An empty list is a no-op.
pub async fn active_channels<T: Transport>(
    client: &RemoteModelClient<T>,
    ids: &[i64],
) -> Result<Vec<ChannelSummary>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let result = client
        .invoke(
            CHANNELS,
            "search_read",
            vec![Value::from(json!([["id", "in", ids], ["active", "=", true]]))],
            kwargs(json!({"fields": ["id", "name", "channel_type", "member_count"]})),
        )
        .await?;

    rows(&result, CHANNELS, "search_read")?
        .iter()
        .map(|row| channel_from_row(row, "search_read"))
        .collect()
}

/// Active channels the server itself reports through its `is_member` filter.
pub async fn member_channels<T: Transport>(
    client: &RemoteModelClient<T>,
) -> Result<Vec<ChannelSummary>> {
    let result = client
        .invoke(
            CHANNELS,
            "search_read",
            vec![Value::from(json!([["is_member", "=", true], ["active", "=", true]]))],
            kwargs(json!({"fields": ["id", "name", "channel_type", "member_count"]})),
        )
        .await?;

    rows(&result, CHANNELS, "search_read")?
        .iter()
        .map(|row| channel_from_row(row, "search_read"))
        .collect()
}

/// System parameters whose key mentions RTC or ICE servers.
///
/// Reading `ir.config_parameter` usually needs administrator rights; the
/// server answers with an access fault otherwise.
pub async fn rtc_parameters<T: Transport>(
    client: &RemoteModelClient<T>,
) -> Result<Vec<ConfigParameter>> {
    let result = client
        .invoke(
            CONFIG_PARAMETERS,
            "search_read",
            vec![Value::from(json!([
                "|",
                ["key", "ilike", "rtc"],
                ["key", "ilike", "ice_server"]
            ]))],
            kwargs(json!({"fields": ["key", "value"]})),
        )
        .await?;

    Ok(rows(&result, CONFIG_PARAMETERS, "search_read")?
        .iter()
        .map(|row| ConfigParameter {
            key: text(row, "key"),
            value: text(row, "value"),
        })
        .collect())
}

/// Field definitions of the call session model, sorted by name.
pub async fn call_session_fields<T: Transport>(
    client: &RemoteModelClient<T>,
) -> Result<Vec<FieldInfo>> {
    let result = client
        .invoke(
            CALL_SESSIONS,
            "fields_get",
            Vec::new(),
            kwargs(json!({"attributes": ["type", "string"]})),
        )
        .await?;

    let fields = result
        .as_struct()
        .ok_or_else(|| unexpected(CALL_SESSIONS, "fields_get", "expected a mapping"))?;

    Ok(fields
        .iter()
        .map(|(name, attrs)| FieldInfo {
            name: name.clone(),
            field_type: text(attrs, "type"),
            label: text(attrs, "string"),
            signaling: is_signaling(name),
        })
        .collect())
}
