//! Discovery bootstrap.
//!
//! Pulls our profile, follow list and relay list from the discovery relays,
//! then opens the long-lived discovery subscriptions (invites, secrets, relay
//! announcements, group metadata) exactly once per client.
//!
//! Concurrent callers share one in-flight run. A host that is not ready yet
//! (e.g. still unlocking keys) can defer; a run requested while deferred is
//! remembered and performed on resume.

use std::sync::Arc;

use futures_util::FutureExt;
use nostr_sdk::prelude::*;
use tracing::{debug, info, warn};

use crate::client::GroupClient;
use crate::error::Result;
use crate::events::event_kind;
use crate::services::notifications::Notification;
use crate::services::subscriptions::{EventHandler, SubscribeOptions};

/// Logical ids of the subscriptions opened by the bootstrap
pub const DISCOVERY_SUBSCRIPTIONS: [&str; 5] = [
    "discovery-self",
    "discovery-invites",
    "discovery-secrets",
    "discovery-announcements",
    "discovery-metadata",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub profile_loaded: bool,
    pub follows: usize,
    pub relays: usize,
    /// Steps that failed (`profile`, `follows`, `relays`); the others still ran
    pub failures: Vec<String>,
    /// Discovery subscriptions opened by this run (zero after the first run)
    pub subscriptions_activated: usize,
    /// The run was postponed by `defer_bootstrap`
    pub deferred: bool,
}

fn newest(events: Vec<Event>, author: &PublicKey) -> Option<Event> {
    events
        .into_iter()
        .filter(|e| e.pubkey == *author)
        .max_by_key(|e| e.created_at)
}

impl GroupClient {
    /// Run the discovery bootstrap, or join the run already in flight.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        self.ensure_active()?;
        {
            let mut state = self.state().await;
            if state.discovery.deferred {
                state.discovery.pending = true;
                debug!("bootstrap deferred");
                return Ok(BootstrapReport { deferred: true, ..Default::default() });
            }
        }

        let in_flight = {
            let mut slot = self.inner.bootstrap.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let client = self.clone();
                    let run = async move {
                        let report = client.run_bootstrap().await;
                        *client.inner.bootstrap.lock().unwrap_or_else(|e| e.into_inner()) = None;
                        report
                    }
                    .boxed()
                    .shared();
                    *slot = Some(run.clone());
                    run
                }
            }
        };
        Ok(in_flight.await)
    }

    /// Postpone bootstrap runs until [`resume_bootstrap`](Self::resume_bootstrap).
    pub async fn defer_bootstrap(&self) {
        self.state().await.discovery.deferred = true;
    }

    /// Lift the deferral. Runs the bootstrap if one was requested meanwhile.
    pub async fn resume_bootstrap(&self) -> Result<Option<BootstrapReport>> {
        self.ensure_active()?;
        let pending = {
            let mut state = self.state().await;
            state.discovery.deferred = false;
            std::mem::take(&mut state.discovery.pending)
        };
        if !pending {
            return Ok(None);
        }
        self.bootstrap().await.map(Some)
    }

    async fn run_bootstrap(&self) -> BootstrapReport {
        let mut report = BootstrapReport::default();
        let me = self.public_key();
        let relays = self.inner.config.discovery_relays.clone();
        let timeout = self.inner.config.bootstrap_fetch_timeout();
        let transport = &self.inner.transport;

        let by_me = |kind: u16| vec![Filter::new().author(me).kind(Kind::from(kind)).limit(1)];
        let (profile, follows, relay_list) = tokio::join!(
            transport.fetch_events(&relays, by_me(event_kind::PROFILE), timeout),
            transport.fetch_events(&relays, by_me(event_kind::FOLLOW_LIST), timeout),
            transport.fetch_events(&relays, by_me(event_kind::USER_RELAY_LIST), timeout),
        );

        if self.is_cancelled() {
            return report;
        }

        {
            let mut state = self.state().await;
            match profile {
                Ok(found) => {
                    if let Some(event) = newest(found, &me) {
                        state.discovery.set_profile(&event);
                    }
                    report.profile_loaded = state.discovery.profile.is_some();
                }
                Err(e) => {
                    warn!(error = %e, "profile fetch failed");
                    report.failures.push("profile".into());
                }
            }
            match follows {
                Ok(found) => {
                    if let Some(event) = newest(found, &me) {
                        state.discovery.set_follows(&event);
                    }
                    report.follows = state.discovery.follows.len();
                }
                Err(e) => {
                    warn!(error = %e, "follow list fetch failed");
                    report.failures.push("follows".into());
                }
            }
            match relay_list {
                Ok(found) => {
                    if let Some(event) = newest(found, &me) {
                        state.discovery.set_relay_list(&event);
                    }
                    report.relays = state.discovery.relay_list.len();
                }
                Err(e) => {
                    warn!(error = %e, "relay list fetch failed");
                    report.failures.push("relays".into());
                }
            }
        }

        let activate = {
            let mut state = self.state().await;
            !std::mem::replace(&mut state.discovery.subscriptions_active, true)
        };
        if activate {
            report.subscriptions_activated = self.activate_discovery_subscriptions(&me, &relays).await;
        }

        if self.is_cancelled() {
            return report;
        }
        self.state().await.discovery.ready = true;
        info!(
            profile = report.profile_loaded,
            follows = report.follows,
            relays = report.relays,
            failures = report.failures.len(),
            "discovery bootstrap complete"
        );
        self.emit(Notification::BootstrapReady);
        report
    }

    /// Events on these subscriptions are handled by the kind dispatcher, so the
    /// handlers themselves do nothing.
    async fn activate_discovery_subscriptions(&self, me: &PublicKey, relays: &[String]) -> usize {
        let noop: EventHandler = Arc::new(|_, _| Ok(()));
        let plans = [
            Filter::new().author(*me).kinds([
                Kind::from(event_kind::PROFILE),
                Kind::from(event_kind::FOLLOW_LIST),
                Kind::from(event_kind::USER_RELAY_LIST),
            ]),
            Filter::new().kind(Kind::from(event_kind::GROUP_INVITE_CREATE)).pubkey(*me),
            Filter::new().kind(Kind::from(event_kind::SECRET_DISTRIBUTION)).pubkey(*me),
            Filter::new().kind(Kind::from(event_kind::HYPERTUNA_RELAY_ANNOUNCE)),
            Filter::new().kind(Kind::from(event_kind::GROUP_METADATA)),
        ];

        let mut opened = 0;
        for (id, filter) in DISCOVERY_SUBSCRIPTIONS.iter().zip(plans) {
            let opts = SubscribeOptions {
                target_relays: relays.to_vec(),
                ..Default::default()
            };
            match self.subscribe(id, vec![filter], noop.clone(), opts).await {
                Ok(_) => opened += 1,
                Err(e) => warn!(subscription = *id, error = %e, "discovery subscription failed"),
            }
        }
        debug!(opened, "discovery subscriptions active");
        opened
    }
}
