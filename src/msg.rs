// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Messages and settings snapshots exchanged with the supervisor.
//!
//! Settings are plain structs passed by value (copy-on-update): a worker
//! holds the snapshot it was dispatched with, and a settings message simply
//! replaces the supervisor's copy for future work.

use base::time::Time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailEncryption {
    #[default]
    None,
    StartTls,
    Tls,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct EmailSettings {
    #[serde(rename = "fromAddr")]
    pub from_addr: String,
    #[serde(rename = "toAddrs")]
    pub to_addrs: String,
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub encryption: EmailEncryption,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub directory: String,
    #[serde(rename = "isPassive")]
    pub is_passive: bool,
}

/// Per-rule export directories, keyed by lowercased rule name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LocalExportSettings {
    pub dirs_by_rule: HashMap<String, PathBuf>,
}

impl LocalExportSettings {
    pub fn dir_for_rule(&self, rule_name: &str) -> Option<&PathBuf> {
        self.dirs_by_rule.get(&rule_name.to_lowercase())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    #[serde(rename = "gatewayGUID")]
    pub gateway_guid: String,
    #[serde(rename = "gatewayPassword")]
    pub gateway_password: String,
}

/// Per-rule response configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ResponseConfig {
    #[serde(rename = "toAddrs")]
    pub to_addrs: Option<String>,
    pub subject: Option<String>,
    #[serde(rename = "maxRes")]
    pub max_res: i32,
    #[serde(rename = "wantLimit")]
    pub want_limit: bool,
    #[serde(rename = "limitSeconds")]
    pub limit_seconds: i64,
    #[serde(rename = "webhookUri")]
    pub webhook_uri: String,
    #[serde(rename = "webhookContentType")]
    pub webhook_content_type: String,
    #[serde(rename = "webhookContent")]
    pub webhook_content: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        ResponseConfig {
            to_addrs: None,
            subject: None,
            max_res: 320,
            want_limit: false,
            limit_seconds: 60,
            webhook_uri: String::new(),
            webhook_content_type: String::new(),
            webhook_content: String::new(),
        }
    }
}

/// Inbound messages the supervisor dispatches.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Quit,
    SendEmail {
        rule_name: String,
        camera: String,
        email_settings: EmailSettings,
        config: ResponseConfig,
        num_triggers: usize,
        obj_list: Vec<i64>,
        first: Time,
        last: Time,
        message_id: String,
    },
    SendPush {
        camera: String,
        rule_name: String,
        ms: Time,
    },
    TriggerIfttt {
        camera: String,
        rule_name: String,
        epoch_secs: i64,
    },
    SendWebhook {
        camera: String,
        rule_name: String,
        uri: String,
        ms: Time,
        content_type: String,
        content: String,
        obj: (i64, Time),
    },
    /// Wakeup only; clip jobs travel through the response database.
    SendClip,
    SetCamResolution {
        camera: String,
        width: i32,
        height: i32,
    },
    SetFtpSettings(FtpSettings),
    SetLocalExportSettings(LocalExportSettings),
    SetNotificationSettings(NotificationSettings),
    SetServicesAuthToken(Option<String>),
    SetDebugConfig(serde_json::Map<String, serde_json::Value>),
    /// Internal: re-examine the retry list without doing anything else.
    Wakeup,
}

/// Coarse message classification used for the per-kind worker caps.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum MsgKind {
    Quit,
    SendEmail,
    SendPush,
    TriggerIfttt,
    SendWebhook,
    SendClip,
    Settings,
    Wakeup,
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Quit => MsgKind::Quit,
            Message::SendEmail { .. } => MsgKind::SendEmail,
            Message::SendPush { .. } => MsgKind::SendPush,
            Message::TriggerIfttt { .. } => MsgKind::TriggerIfttt,
            Message::SendWebhook { .. } => MsgKind::SendWebhook,
            Message::SendClip => MsgKind::SendClip,
            Message::SetCamResolution { .. }
            | Message::SetFtpSettings(_)
            | Message::SetLocalExportSettings(_)
            | Message::SetNotificationSettings(_)
            | Message::SetServicesAuthToken(_)
            | Message::SetDebugConfig(_) => MsgKind::Settings,
            Message::Wakeup => MsgKind::Wakeup,
        }
    }
}

/// Outbound events for the host process (capture pipelines, UI).
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Ask the capture pipeline to flush `camera`'s video to disk, at least
    /// through `ms` when given.
    FlushVideo { camera: String, ms: Option<Time> },

    /// Mark recorded ranges as saved (from record-tag responses).
    AddSavedTimes {
        camera: String,
        ranges: Vec<(Time, Time)>,
    },

    /// Liveness signal emitted on a fixed cadence.
    Ping,

    /// A database reported corruption; the operator must intervene.
    DatabaseCorrupt,
}
