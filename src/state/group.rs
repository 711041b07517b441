//! Group metadata, invites, join requests and timelines.

use std::collections::{BTreeMap, HashMap};

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::events::{self, event_kind};

/// Group metadata as published in kind 39000 (or authored locally on create).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub about: String,
    /// `public` / `private` flag tag; defaults to public
    #[serde(default = "default_true")]
    pub is_public: bool,
    /// `open` / `closed` flag tag; defaults to open
    #[serde(default = "default_true")]
    pub is_open: bool,
    #[serde(default)]
    pub file_sharing: bool,
    #[serde(default)]
    pub encrypted_replication: bool,
    /// Hypertuna relay key backing this group, when announced
    #[serde(default)]
    pub relay_key: Option<String>,
    pub created_at: u64,
}

fn default_true() -> bool {
    true
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            about: String::new(),
            is_public: true,
            is_open: true,
            file_sharing: false,
            encrypted_replication: false,
            relay_key: None,
            created_at,
        }
    }

    /// Parse a kind 39000 metadata event. Returns `None` if the `d` tag is missing.
    pub fn from_metadata_event(event: &Event) -> Option<Self> {
        let id = events::first_tag_value(event, "d")?.to_string();
        let mut group = Group::new(id, "", events::created_at_of(event));

        group.name = events::first_tag_value(event, "name").unwrap_or_default().to_string();
        group.about = events::first_tag_value(event, "about").unwrap_or_default().to_string();
        group.is_public = !events::has_flag(event, "private");
        group.is_open = !events::has_flag(event, "closed");
        group.file_sharing = switch_tag(event, "file-sharing");
        group.encrypted_replication = switch_tag(event, "encrypted-replication");
        group.relay_key = events::first_tag_value(event, "hypertuna").map(str::to_string);

        Some(group)
    }

    /// Tags describing this group, as used in create / edit-metadata events.
    pub fn metadata_tags(&self) -> Vec<Tag> {
        let mut tags = vec![
            events::tag("h", [self.id.as_str()]),
            events::tag("name", [self.name.as_str()]),
            events::tag("about", [self.about.as_str()]),
            events::tag(if self.is_public { "public" } else { "private" }, Vec::<String>::new()),
            events::tag(if self.is_open { "open" } else { "closed" }, Vec::<String>::new()),
            events::tag("file-sharing", [on_off(self.file_sharing)]),
            events::tag("encrypted-replication", [on_off(self.encrypted_replication)]),
        ];
        if let Some(relay_key) = &self.relay_key {
            tags.push(events::tag("hypertuna", [relay_key.as_str()]));
        }
        tags
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn switch_tag(event: &Event, name: &str) -> bool {
    matches!(events::first_tag_value(event, name), Some("on") | Some("true"))
}

/// Decrypted content of a kind 9009 invite addressed to us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub relay_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub relay_key: Option<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub event_id: String,
    pub group_id: String,
    pub inviter: String,
    pub payload: InvitePayload,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub group_id: String,
    pub pubkey: String,
    /// Invite code presented with the request, if any
    pub code: Option<String>,
    pub created_at: u64,
}

/// Announcement of the Hypertuna relay serving a group (kind 30166)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAnnouncement {
    pub group_id: String,
    pub relay_url: String,
    pub requires_auth: bool,
    pub created_at: u64,
}

/// Ordered, de-duplicated message timeline for one group
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: BTreeMap<(u64, String), Event>,
    ids: HashMap<String, u64>,
}

impl Timeline {
    /// Insert an event; returns false for duplicates
    pub fn insert(&mut self, event: Event) -> bool {
        let id = event.id.to_hex();
        if self.ids.contains_key(&id) {
            return false;
        }
        let created_at = events::created_at_of(&event);
        self.ids.insert(id.clone(), created_at);
        self.events.insert((created_at, id), event);
        true
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Oldest first
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    pub fn latest(&self) -> Option<&Event> {
        self.events.values().next_back()
    }
}

/// All per-group state that is not membership or replication
#[derive(Debug, Default)]
pub struct GroupStateStore {
    groups: HashMap<String, Group>,
    invites: HashMap<String, Invite>,
    join_requests: HashMap<String, HashMap<String, JoinRequest>>,
    timelines: HashMap<String, Timeline>,
    announcements: HashMap<String, RelayAnnouncement>,
}

impl GroupStateStore {
    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.get(group_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Apply metadata if it is strictly newer than what we hold.
    pub fn apply_metadata(&mut self, group: Group) -> bool {
        match self.groups.get(&group.id) {
            Some(existing) if existing.created_at >= group.created_at => false,
            _ => {
                self.groups.insert(group.id.clone(), group);
                true
            }
        }
    }

    /// Drop everything we know about a group (leave / delete)
    pub fn remove_group(&mut self, group_id: &str) -> Option<Group> {
        self.join_requests.remove(group_id);
        self.timelines.remove(group_id);
        self.announcements.remove(group_id);
        self.invites.retain(|_, inv| inv.group_id != group_id);
        self.groups.remove(group_id)
    }

    pub fn add_invite(&mut self, invite: Invite) -> bool {
        if self.invites.contains_key(&invite.event_id) {
            return false;
        }
        self.invites.insert(invite.event_id.clone(), invite);
        true
    }

    pub fn invite(&self, event_id: &str) -> Option<&Invite> {
        self.invites.get(event_id)
    }

    pub fn invites(&self) -> impl Iterator<Item = &Invite> {
        self.invites.values()
    }

    pub fn take_invite(&mut self, event_id: &str) -> Option<Invite> {
        self.invites.remove(event_id)
    }

    /// Invites become moot once we are a member of their group
    pub fn drop_invites_for_group(&mut self, group_id: &str) -> usize {
        let before = self.invites.len();
        self.invites.retain(|_, inv| inv.group_id != group_id);
        before - self.invites.len()
    }

    pub fn add_join_request(&mut self, request: JoinRequest) -> bool {
        let requests = self.join_requests.entry(request.group_id.clone()).or_default();
        match requests.get(&request.pubkey) {
            Some(existing) if existing.created_at >= request.created_at => false,
            _ => {
                requests.insert(request.pubkey.clone(), request);
                true
            }
        }
    }

    pub fn join_requests(&self, group_id: &str) -> Vec<&JoinRequest> {
        let mut out: Vec<_> = self
            .join_requests
            .get(group_id)
            .map(|r| r.values().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.created_at);
        out
    }

    pub fn take_join_request(&mut self, group_id: &str, pubkey: &str) -> Option<JoinRequest> {
        self.join_requests.get_mut(group_id)?.remove(pubkey)
    }

    pub fn timeline(&self, group_id: &str) -> Option<&Timeline> {
        self.timelines.get(group_id)
    }

    pub fn push_message(&mut self, group_id: &str, event: Event) -> bool {
        self.timelines.entry(group_id.to_string()).or_default().insert(event)
    }

    pub fn set_announcement(&mut self, announcement: RelayAnnouncement) -> bool {
        match self.announcements.get(&announcement.group_id) {
            Some(existing) if existing.created_at >= announcement.created_at => false,
            _ => {
                self.announcements.insert(announcement.group_id.clone(), announcement);
                true
            }
        }
    }

    pub fn announcement(&self, group_id: &str) -> Option<&RelayAnnouncement> {
        self.announcements.get(group_id)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Parse a kind 30166 relay announcement
pub fn parse_announcement(event: &Event) -> Option<RelayAnnouncement> {
    if events::kind_of(event) != event_kind::HYPERTUNA_RELAY_ANNOUNCE {
        return None;
    }
    let group_id = events::first_tag_value(event, "d")?.to_string();
    let relay_url = events::first_tag_value(event, "r")?.to_string();
    Some(RelayAnnouncement {
        group_id,
        relay_url,
        requires_auth: switch_tag(event, "auth"),
        created_at: events::created_at_of(event),
    })
}
