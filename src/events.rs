//! Protocol event kinds and tag helpers.
//!
//! Group events follow NIP-29: relay-generated state lives in addressable kinds
//! (39000-39002, `d` tag = group id) and user/admin actions carry an `h` tag.

use std::borrow::Cow;

use nostr_sdk::prelude::*;

/// Event kinds consumed and produced by the engine
pub mod event_kind {
    pub const PROFILE: u16 = 0;
    pub const TEXT_NOTE: u16 = 1;
    pub const FOLLOW_LIST: u16 = 3;
    /// NIP-29 chat message
    pub const CHAT_MESSAGE: u16 = 9;
    pub const GROUP_PUT_USER: u16 = 9000;
    pub const GROUP_REMOVE_USER: u16 = 9001;
    pub const GROUP_EDIT_METADATA: u16 = 9002;
    pub const GROUP_CREATE: u16 = 9007;
    pub const GROUP_DELETE: u16 = 9008;
    pub const GROUP_INVITE_CREATE: u16 = 9009;
    pub const GROUP_JOIN_REQUEST: u16 = 9021;
    pub const GROUP_LEAVE_REQUEST: u16 = 9022;
    /// NIP-65 relay list
    pub const USER_RELAY_LIST: u16 = 10002;
    /// Replication secret handed to one member (NIP-44 encrypted content)
    pub const SECRET_DISTRIBUTION: u16 = 30078;
    pub const HYPERTUNA_RELAY_ANNOUNCE: u16 = 30166;
    pub const GROUP_METADATA: u16 = 39000;
    pub const GROUP_ADMIN_LIST: u16 = 39001;
    pub const GROUP_MEMBER_LIST: u16 = 39002;

    /// Kinds rendered on a group timeline
    pub fn is_message(kind: u16) -> bool {
        kind == TEXT_NOTE || kind == CHAT_MESSAGE
    }

    /// Relay-generated addressable group state (identified by `d`, not `h`)
    pub fn is_group_state(kind: u16) -> bool {
        matches!(kind, GROUP_METADATA | GROUP_ADMIN_LIST | GROUP_MEMBER_LIST)
    }
}

/// Build a tag from a name and values.
pub fn tag<I, S>(name: &str, values: I) -> Tag
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Tag::custom(TagKind::Custom(Cow::Owned(name.to_string())), values)
}

/// All tags named `name`, as raw string slices (name included at index 0).
pub fn tags_named<'a>(event: &'a Event, name: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .filter(move |values| values.first().map(|s| s.as_str()) == Some(name))
}

/// First value of the first tag named `name`.
pub fn first_tag_value<'a>(event: &'a Event, name: &'a str) -> Option<&'a str> {
    tags_named(event, name)
        .find_map(|values| values.get(1))
        .map(|s| s.as_str())
}

/// Group id an event belongs to: `d` for relay state, `h` for everything else.
pub fn group_id_of(event: &Event) -> Option<&str> {
    if event_kind::is_group_state(event.kind.as_u16()) {
        first_tag_value(event, "d")
    } else {
        first_tag_value(event, "h")
    }
}

/// `p` tags as (pubkey hex, roles). Roles are the tag values after the pubkey.
pub fn member_tags(event: &Event) -> Vec<(String, Vec<String>)> {
    tags_named(event, "p")
        .filter_map(|values| {
            let pubkey = values.get(1)?;
            let roles = values
                .iter()
                .skip(2)
                .filter(|r| !r.is_empty())
                .cloned()
                .collect();
            Some((pubkey.to_lowercase(), roles))
        })
        .collect()
}

/// Whether the event carries a bare flag tag such as `["public"]`.
pub fn has_flag(event: &Event, name: &str) -> bool {
    tags_named(event, name).next().is_some()
}

pub fn kind_of(event: &Event) -> u16 {
    event.kind.as_u16()
}

pub fn created_at_of(event: &Event) -> u64 {
    event.created_at.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(kind: u16, tags: Vec<Tag>) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::from(kind), "")
            .tags(tags)
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn test_group_id_uses_d_for_state_and_h_otherwise() {
        let meta = signed(
            event_kind::GROUP_METADATA,
            vec![tag("d", ["g1"]), tag("h", ["other"])],
        );
        assert_eq!(group_id_of(&meta), Some("g1"));

        let msg = signed(event_kind::CHAT_MESSAGE, vec![tag("h", ["g2"])]);
        assert_eq!(group_id_of(&msg), Some("g2"));

        let stray = signed(event_kind::CHAT_MESSAGE, vec![]);
        assert_eq!(group_id_of(&stray), None);
    }

    #[test]
    fn test_member_tags_with_roles() {
        let pk = Keys::generate().public_key().to_hex();
        let event = signed(
            event_kind::GROUP_ADMIN_LIST,
            vec![
                tag("d", ["g1"]),
                tag("p", [pk.as_str(), "admin", "moderator"]),
                tag("p", [pk.as_str()]),
            ],
        );

        let members = member_tags(&event);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].1, vec!["admin".to_string(), "moderator".to_string()]);
        assert!(members[1].1.is_empty());
    }

    #[test]
    fn test_flags() {
        let event = signed(event_kind::GROUP_METADATA, vec![tag("public", Vec::<String>::new())]);
        assert!(has_flag(&event, "public"));
        assert!(!has_flag(&event, "closed"));
    }
}
