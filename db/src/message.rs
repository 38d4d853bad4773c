use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::info;

use crate::models::{AgentProfile, Client, MediaPath, RingPath};

/// Error codes surfaced to API clients. The wire form is the
/// SCREAMING_SNAKE string.
#[derive(Display, EnumString, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ErrCode {
    #[strum(serialize = "NO_FUNCTION")]
    NoFunction,
    #[strum(serialize = "FUNCTION_NOEXISTS")]
    FunctionNoexists,
    #[strum(serialize = "BAD_COOKIE")]
    BadCookie,
    #[strum(serialize = "NO_AGENT")]
    NoAgent,
    #[strum(serialize = "NO_SALT")]
    NoSalt,
    #[strum(serialize = "DECRYPT_FAILED")]
    DecryptFailed,
    #[strum(serialize = "AUTH_FAILED")]
    AuthFailed,
    #[strum(serialize = "UNKNOWN_ERROR")]
    UnknownError,
}

/// A protocol failure carried back to the client as
/// `{success: false, message, errcode}` with HTTP 200.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct ApiError {
    pub errcode: ErrCode,
    pub message: String,
}

impl ApiError {
    pub fn new(errcode: ErrCode, message: &str) -> Self {
        Self {
            errcode,
            message: message.to_string(),
        }
    }

    pub fn unknown(message: &str) -> Self {
        Self::new(ErrCode::UnknownError, message)
    }
}

#[derive(Display, EnumString, PartialEq, Eq, Clone, Copy, Debug)]
pub enum EndpointKind {
    #[strum(to_string = "sip_registration", serialize = "sip_registation")]
    SipRegistration,
    #[strum(serialize = "sip")]
    Sip,
    #[strum(serialize = "iax2")]
    Iax2,
    #[strum(serialize = "h323")]
    H323,
    #[strum(serialize = "pstn")]
    Pstn,
}

/// Resolved phone-driver binding for a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    pub kind: EndpointKind,
    pub data: String,
}

/// The `opts` object of a login request, verbatim from the client.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct LoginOpts {
    #[serde(default)]
    pub voipendpoint: Option<String>,
    #[serde(default)]
    pub voipendpointdata: Option<String>,
    #[serde(default)]
    pub useoutbandring: Option<bool>,
}

impl LoginOpts {
    /// Endpoint resolution used verbatim by the channel layer.
    /// `sip_registration` is the default kind and falls back to the login
    /// name when no endpoint data is supplied.
    pub fn resolve(&self, username: &str) -> Result<EndpointSpec, ApiError> {
        let kind = match self.voipendpoint.as_deref() {
            None => EndpointKind::SipRegistration,
            Some(s) => EndpointKind::from_str(s).map_err(|_| {
                ApiError::unknown(&format!("unknown voipendpoint {s}"))
            })?,
        };
        let data = match (&self.voipendpointdata, kind) {
            (Some(data), _) => data.clone(),
            (None, EndpointKind::SipRegistration) => username.to_string(),
            (None, _) => String::new(),
        };
        Ok(EndpointSpec { kind, data })
    }

    pub fn ring_path(&self, agent_default: RingPath) -> RingPath {
        match self.useoutbandring {
            Some(true) => RingPath::Outband,
            Some(false) => RingPath::Inband,
            None => agent_default,
        }
    }
}

#[derive(
    Display, EnumString, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Debug,
)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[strum(serialize = "voice")]
    Voice,
    #[strum(serialize = "chat")]
    Chat,
    #[strum(serialize = "email")]
    Email,
    #[strum(serialize = "voicemail")]
    Voicemail,
}

#[derive(
    Display, EnumString, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Debug,
)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[strum(serialize = "prering")]
    Prering,
    #[strum(serialize = "ringing")]
    Ringing,
    #[strum(serialize = "precall")]
    Precall,
    #[strum(serialize = "oncall")]
    Oncall,
    #[strum(serialize = "warmtransfer_hold")]
    #[serde(rename = "warmtransfer_hold")]
    WarmtransferHold,
    #[strum(serialize = "warmtransfer_3rd_party")]
    #[serde(rename = "warmtransfer_3rd_party")]
    Warmtransfer3rdParty,
    #[strum(serialize = "wrapup")]
    Wrapup,
}

/// Commands a channel issues against the media gateway leg of its call.
/// The gateway is an external collaborator; commands are one-way.
pub trait MediaPeer: Send + Sync {
    fn oncall(&self, call_id: &str);
    fn wrapup(&self, call_id: &str);
    fn hangup(&self, call_id: &str);
}

/// Gateway stand-in used where no media leg exists (chat, email, tests).
pub struct NullMediaPeer;

impl MediaPeer for NullMediaPeer {
    fn oncall(&self, call_id: &str) {
        info!(call = call_id, "media oncall");
    }

    fn wrapup(&self, call_id: &str) {
        info!(call = call_id, "media wrapup");
    }

    fn hangup(&self, call_id: &str) {
        info!(call = call_id, "media hangup");
    }
}

/// One media interaction as owned by a channel.
#[derive(Clone)]
pub struct Call {
    pub id: String,
    pub call_type: CallType,
    pub client: Option<Client>,
    pub caller_id: String,
    pub ring_path: RingPath,
    pub media_path: MediaPath,
    pub source: Arc<dyn MediaPeer>,
    pub state_changes: Vec<(ChannelState, DateTime<Utc>)>,
}

impl Call {
    pub fn new(
        id: &str,
        call_type: CallType,
        caller_id: &str,
        source: Arc<dyn MediaPeer>,
    ) -> Self {
        Self {
            id: id.to_string(),
            call_type,
            client: None,
            caller_id: caller_id.to_string(),
            ring_path: RingPath::Inband,
            media_path: MediaPath::Inband,
            source,
            state_changes: Vec::new(),
        }
    }

    pub fn push_state(&mut self, state: ChannelState) {
        self.state_changes.push((state, Utc::now()));
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            id: self.id.clone(),
            call_type: self.call_type,
            client: self.client.as_ref().map(|c| c.id.clone()),
            caller_id: self.caller_id.clone(),
            state_changes: self.state_changes.clone(),
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("call_type", &self.call_type)
            .field("caller_id", &self.caller_id)
            .field("ring_path", &self.ring_path)
            .field("media_path", &self.media_path)
            .finish()
    }
}

/// Plain-data view of a call for events and the CDR sink.
#[derive(Serialize, Clone, Debug)]
pub struct CallSnapshot {
    pub id: String,
    pub call_type: CallType,
    pub client: Option<String>,
    pub caller_id: String,
    pub state_changes: Vec<(ChannelState, DateTime<Utc>)>,
}

/// The channel property published to the cluster-local registry on every
/// transition.
#[derive(Serialize, Clone, Debug)]
pub struct ChannelProp {
    pub channel_id: String,
    pub login: String,
    pub profile: String,
    pub media_type: CallType,
    pub client: Option<String>,
    pub caller_id: String,
    pub state: ChannelState,
}

/// Events delivered to a waiting poll request.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PollEvent {
    SetChannel {
        channel_id: String,
        state: ChannelState,
        call_id: String,
    },
    EndChannel {
        channel_id: String,
    },
    SetRelease {
        release: Option<String>,
    },
    MediaEvent {
        channel_id: String,
        data: Value,
    },
}

/// Channel lifecycle fan-out on the event manager.
#[derive(Clone, Debug)]
pub enum ChannelLifecycleEvent {
    Initiated {
        at: DateTime<Utc>,
        channel_id: String,
        call: CallSnapshot,
    },
    StateUpdate {
        at: DateTime<Utc>,
        channel_id: String,
        agent_login: String,
        new_state: ChannelState,
        old_state: ChannelState,
        prop: ChannelProp,
    },
    Terminated {
        at: DateTime<Utc>,
        agent: AgentProfile,
        call: CallSnapshot,
        from_wrapup: bool,
    },
}

/// A request parsed into a typed command. The JSON API and the legacy
/// paths both land here, so dispatch is identical for either surface.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    CheckCookie,
    GetSalt,
    Login {
        username: String,
        password: String,
        opts: LoginOpts,
    },
    GetQueueList,
    GetBrandList,
    GetReleaseOpts,
    Poll,
    Logout,
    SetState {
        state: String,
        data: Option<String>,
    },
    Ack {
        counter: u64,
    },
    Err {
        counter: u64,
        message: Option<String>,
    },
    Dial {
        number: String,
    },
    GetAvailAgents,
    AgentTransfer {
        agent: String,
        case_id: Option<String>,
    },
    MediaPush {
        data: Value,
    },
    WarmTransfer {
        number: String,
    },
    WarmTransferComplete,
    WarmTransferCancel,
    QueueTransfer {
        queue: String,
    },
    InitOutbound {
        client: String,
        media_type: String,
    },
    Supervisor {
        path: Vec<String>,
    },
    /// Unknown function names are carried through so the connection
    /// worker can answer FUNCTION_NOEXISTS itself.
    Raw {
        function: String,
        args: Vec<Value>,
    },
}

impl PartialEq for LoginOpts {
    fn eq(&self, other: &Self) -> bool {
        self.voipendpoint == other.voipendpoint
            && self.voipendpointdata == other.voipendpointdata
            && self.useoutbandring == other.useoutbandring
    }
}

fn arg_str(args: &[Value], n: usize) -> Result<String, ApiError> {
    args.get(n)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::unknown(&format!("missing argument {n}")))
}

impl ApiCall {
    /// Parse the JSON API surface: `{function: string, args: array}`.
    pub fn from_function(function: &str, args: &[Value]) -> Result<Self, ApiError> {
        let call = match function {
            "check_cookie" => Self::CheckCookie,
            "get_salt" => Self::GetSalt,
            "login" => {
                let opts = match args.get(2) {
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| ApiError::unknown(&format!("bad opts: {e}")))?,
                    None => LoginOpts::default(),
                };
                Self::Login {
                    username: arg_str(args, 0)?,
                    password: arg_str(args, 1)?,
                    opts,
                }
            }
            "get_queue_list" => Self::GetQueueList,
            "get_brand_list" => Self::GetBrandList,
            "get_release_opts" => Self::GetReleaseOpts,
            "poll" => Self::Poll,
            "logout" => Self::Logout,
            "set_state" => Self::SetState {
                state: arg_str(args, 0)?,
                data: args.get(1).and_then(|v| v.as_str()).map(|s| s.to_string()),
            },
            "dial" => Self::Dial {
                number: arg_str(args, 0)?,
            },
            "get_avail_agents" => Self::GetAvailAgents,
            "agent_transfer" => Self::AgentTransfer {
                agent: arg_str(args, 0)?,
                case_id: args.get(1).and_then(|v| v.as_str()).map(|s| s.to_string()),
            },
            "mediapush" => Self::MediaPush {
                data: args.first().cloned().unwrap_or(Value::Null),
            },
            "warm_transfer" => Self::WarmTransfer {
                number: arg_str(args, 0)?,
            },
            "warm_transfer_complete" => Self::WarmTransferComplete,
            "warm_transfer_cancel" => Self::WarmTransferCancel,
            "queue_transfer" => Self::QueueTransfer {
                queue: arg_str(args, 0)?,
            },
            "init_outbound" => Self::InitOutbound {
                client: arg_str(args, 0)?,
                media_type: arg_str(args, 1)?,
            },
            _ => Self::Raw {
                function: function.to_string(),
                args: args.to_vec(),
            },
        };
        Ok(call)
    }

    /// Parse the legacy path surface. Returns None when the path is not a
    /// known command, in which case the dispatcher falls through to file
    /// serving and then to the raw agent-connection API.
    pub fn from_path(
        path: &str,
        form: &HashMap<String, String>,
    ) -> Option<Result<Self, ApiError>> {
        let segments: Vec<&str> =
            path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
        let call = match segments.as_slice() {
            ["checkcookie"] => Self::CheckCookie,
            ["getsalt"] => Self::GetSalt,
            ["login"] => {
                let username = match form.get("username") {
                    Some(u) => u.clone(),
                    None => {
                        return Some(Err(ApiError::new(
                            ErrCode::NoFunction,
                            "login requires a username",
                        )))
                    }
                };
                let password = match form.get("password") {
                    Some(p) => p.clone(),
                    None => {
                        return Some(Err(ApiError::new(
                            ErrCode::NoFunction,
                            "login requires a password",
                        )))
                    }
                };
                Self::Login {
                    username,
                    password,
                    opts: LoginOpts {
                        voipendpoint: form.get("voipendpoint").cloned(),
                        voipendpointdata: form.get("voipendpointdata").cloned(),
                        useoutbandring: form
                            .get("useoutbandring")
                            .map(|v| v == "true"),
                    },
                }
            }
            ["poll"] => Self::Poll,
            ["logout"] => Self::Logout,
            ["brandlist"] => Self::GetBrandList,
            ["queuelist"] => Self::GetQueueList,
            ["releaseopts"] => Self::GetReleaseOpts,
            ["state", state] => Self::SetState {
                state: state.to_string(),
                data: None,
            },
            ["state", state, data] => Self::SetState {
                state: state.to_string(),
                data: Some(data.to_string()),
            },
            ["ack", counter] => match counter.parse() {
                Ok(counter) => Self::Ack { counter },
                Err(_) => return Some(Err(ApiError::unknown("bad ack counter"))),
            },
            ["err", counter, ..] => match counter.parse() {
                Ok(counter) => Self::Err {
                    counter,
                    message: segments.get(2).map(|s| s.to_string()),
                },
                Err(_) => return Some(Err(ApiError::unknown("bad err counter"))),
            },
            ["dial", number] => Self::Dial {
                number: number.to_string(),
            },
            ["get_avail_agents"] => Self::GetAvailAgents,
            ["agent_transfer", agent] => Self::AgentTransfer {
                agent: agent.to_string(),
                case_id: None,
            },
            ["agent_transfer", agent, case_id] => Self::AgentTransfer {
                agent: agent.to_string(),
                case_id: Some(case_id.to_string()),
            },
            ["mediapush"] => Self::MediaPush {
                data: serde_json::to_value(form).unwrap_or(Value::Null),
            },
            ["warm_transfer", number] => Self::WarmTransfer {
                number: number.to_string(),
            },
            ["warm_transfer_complete"] | ["warm_transfer_complete", _] => {
                Self::WarmTransferComplete
            }
            ["warm_transfer_cancel"] | ["warm_transfer_cancel", _] => {
                Self::WarmTransferCancel
            }
            ["queue_transfer", queue] => Self::QueueTransfer {
                queue: queue.to_string(),
            },
            ["init_outbound", client, media_type] => Self::InitOutbound {
                client: client.to_string(),
                media_type: media_type.to_string(),
            },
            ["supervisor", rest @ ..] => Self::Supervisor {
                path: rest.iter().map(|s| s.to_string()).collect(),
            },
            _ => return None,
        };
        Some(Ok(call))
    }

    /// True for the operations served before any connection worker exists.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::CheckCookie
                | Self::GetSalt
                | Self::Login { .. }
                | Self::GetQueueList
                | Self::GetBrandList
                | Self::GetReleaseOpts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_typo_normalised() {
        assert_eq!(
            EndpointKind::from_str("sip_registation").unwrap(),
            EndpointKind::SipRegistration
        );
        assert_eq!(
            EndpointKind::SipRegistration.to_string(),
            "sip_registration"
        );
    }

    #[test]
    fn endpoint_data_defaults_to_username() {
        let opts = LoginOpts::default();
        let spec = opts.resolve("alice").unwrap();
        assert_eq!(spec.kind, EndpointKind::SipRegistration);
        assert_eq!(spec.data, "alice");

        let opts = LoginOpts {
            voipendpoint: Some("pstn".to_string()),
            voipendpointdata: Some("02080908160".to_string()),
            useoutbandring: Some(true),
        };
        let spec = opts.resolve("alice").unwrap();
        assert_eq!(spec.kind, EndpointKind::Pstn);
        assert_eq!(spec.data, "02080908160");
        assert_eq!(opts.ring_path(RingPath::Inband), RingPath::Outband);
    }

    #[test]
    fn legacy_paths_parse() {
        let form = HashMap::new();
        assert_eq!(
            ApiCall::from_path("/getsalt", &form).unwrap().unwrap(),
            ApiCall::GetSalt
        );
        assert_eq!(
            ApiCall::from_path("/state/released/tea", &form)
                .unwrap()
                .unwrap(),
            ApiCall::SetState {
                state: "released".to_string(),
                data: Some("tea".to_string()),
            }
        );
        assert_eq!(
            ApiCall::from_path("/queue_transfer/support", &form)
                .unwrap()
                .unwrap(),
            ApiCall::QueueTransfer {
                queue: "support".to_string(),
            }
        );
        assert!(ApiCall::from_path("/style.css", &form).is_none());
    }

    #[test]
    fn unknown_function_is_raw() {
        let call = ApiCall::from_function("frobnicate", &[]).unwrap();
        assert_eq!(
            call,
            ApiCall::Raw {
                function: "frobnicate".to_string(),
                args: Vec::new(),
            }
        );
    }

    #[test]
    fn errcode_wire_form() {
        assert_eq!(ErrCode::BadCookie.to_string(), "BAD_COOKIE");
        assert_eq!(ErrCode::FunctionNoexists.to_string(), "FUNCTION_NOEXISTS");
    }
}
