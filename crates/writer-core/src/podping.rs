//! The podping payload schema: medium/reason vocabulary, the notification
//! document, and operation-id formatting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix appended to the operation-id prefix for startup notices.
pub const STARTUP_OPERATION_ID: &str = "_startup";

/// Podcast-namespace medium of the feeds being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    /// An episodic audio show.
    Podcast,
    /// A music feed.
    Music,
    /// An episodic video show.
    Video,
    /// A feed carrying one film or a film series.
    Film,
    /// A feed carrying audiobook chapters.
    Audiobook,
    /// A written-first feed with audio attached.
    Newsletter,
    /// A written-first feed without regular audio.
    Blog,
}

impl Medium {
    /// Canonical string form used in payloads and operation ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Medium::Podcast => "podcast",
            Medium::Music => "music",
            Medium::Video => "video",
            Medium::Film => "film",
            Medium::Audiobook => "audiobook",
            Medium::Newsletter => "newsletter",
            Medium::Blog => "blog",
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Medium {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "podcast" => Ok(Medium::Podcast),
            "music" => Ok(Medium::Music),
            "video" => Ok(Medium::Video),
            "film" => Ok(Medium::Film),
            "audiobook" => Ok(Medium::Audiobook),
            "newsletter" => Ok(Medium::Newsletter),
            "blog" => Ok(Medium::Blog),
            other => Err(format!("unknown medium: {other:?}")),
        }
    }
}

/// Cause of the feed-update notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reason {
    /// The feed content changed.
    Update,
    /// A live stream in the feed went live.
    Live,
    /// A live stream in the feed ended.
    LiveEnd,
}

impl Reason {
    /// Canonical string form used in payloads and operation ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Update => "update",
            Reason::Live => "live",
            Reason::LiveEnd => "liveEnd",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(Reason::Update),
            "live" => Ok(Reason::Live),
            "liveEnd" => Ok(Reason::LiveEnd),
            other => Err(format!("unknown reason: {other:?}")),
        }
    }
}

/// Operation id for a podping `custom_json`: `<prefix>_<medium>_<reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiveOperationId {
    prefix: String,
    medium: Medium,
    reason: Reason,
}

impl HiveOperationId {
    /// Build an operation id from the configured prefix and the payload tags.
    pub fn new(prefix: impl Into<String>, medium: Medium, reason: Reason) -> Self {
        Self {
            prefix: prefix.into(),
            medium,
            reason,
        }
    }
}

impl fmt::Display for HiveOperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.prefix, self.medium, self.reason)
    }
}

/// Operation id for the startup notices: `<prefix>_startup`.
pub fn startup_operation_id(prefix: &str) -> String {
    format!("{prefix}{STARTUP_OPERATION_ID}")
}

/// The payload document of a feed-update notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Podping {
    /// Medium of the announced feeds.
    pub medium: Medium,
    /// Cause of the notification.
    pub reason: Reason,
    /// The announced feed IRIs.
    pub iris: Vec<String>,
}

impl Podping {
    /// Assemble a notification document.
    pub fn new(medium: Medium, reason: Reason, iris: impl IntoIterator<Item = String>) -> Self {
        Self {
            medium,
            reason,
            iris: iris.into_iter().collect(),
        }
    }
}

/// Payload document of the startup notices published by the boot probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupNotice {
    /// Account publishing the notice.
    pub server_account: String,
    /// Human-readable startup phase.
    pub message: String,
    /// Unique id of this startup sequence.
    pub uuid: Uuid,
    /// RPC node selected at the time of the notice.
    pub hive: String,
    /// Writer version, present on the completion notice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Projected ping capacity, present on the completion notice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
}

impl StartupNotice {
    /// The notice published before the resource probe runs.
    pub fn initiated(server_account: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            server_account: server_account.into(),
            message: "Podping startup initiated".to_string(),
            uuid: Uuid::new_v4(),
            hive: node.into(),
            v: None,
            capacity: None,
        }
    }

    /// Upgrade to the completion notice announcing version and capacity.
    pub fn completed(mut self, version: impl Into<String>, capacity: impl Into<String>, node: impl Into<String>) -> Self {
        self.message = "Podping startup complete".to_string();
        self.v = Some(version.into());
        self.capacity = Some(capacity.into());
        self.hive = node.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_and_reason_string_forms() {
        assert_eq!(Medium::Podcast.to_string(), "podcast");
        assert_eq!(Reason::LiveEnd.to_string(), "liveEnd");
        assert_eq!("audiobook".parse::<Medium>().unwrap(), Medium::Audiobook);
        assert_eq!("liveEnd".parse::<Reason>().unwrap(), Reason::LiveEnd);
        assert!("podcasts".parse::<Medium>().is_err());
    }

    #[test]
    fn serde_forms_match_display_forms() {
        assert_eq!(
            serde_json::to_string(&Medium::Newsletter).unwrap(),
            "\"newsletter\""
        );
        assert_eq!(serde_json::to_string(&Reason::LiveEnd).unwrap(), "\"liveEnd\"");
        assert_eq!(
            serde_json::from_str::<Reason>("\"liveEnd\"").unwrap(),
            Reason::LiveEnd
        );
    }

    #[test]
    fn operation_id_formatting() {
        let id = HiveOperationId::new("pp", Medium::Podcast, Reason::Update);
        assert_eq!(id.to_string(), "pp_podcast_update");
        assert_eq!(startup_operation_id("pp"), "pp_startup");
    }

    #[test]
    fn podping_document_shape() {
        let podping = Podping::new(
            Medium::Podcast,
            Reason::Update,
            ["https://example.com/feed.xml".to_string()],
        );
        let json = serde_json::to_string(&podping).unwrap();
        assert_eq!(
            json,
            r#"{"medium":"podcast","reason":"update","iris":["https://example.com/feed.xml"]}"#
        );
    }

    #[test]
    fn startup_notice_omits_unset_fields() {
        let notice = StartupNotice::initiated("podping.test", "https://api.hive.blog/");
        let value = serde_json::to_value(&notice).unwrap();
        assert!(value.get("v").is_none());
        assert!(value.get("capacity").is_none());

        let value = serde_json::to_value(
            notice.completed("1.2.0", "52000", "https://api.hive.blog/"),
        )
        .unwrap();
        assert_eq!(value["v"], "1.2.0");
        assert_eq!(value["capacity"], "52000");
        assert_eq!(value["message"], "Podping startup complete");
    }
}
