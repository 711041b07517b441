//! Outbound group actions, organized by domain.
//!
//! This module adds user actions to [`GroupClient`]:
//! - `groups`: Create, edit, delete, leave, membership moderation, messaging
//! - `invites`: Invites, join requests and their approval
//!
//! Admin-only actions check our roles in the reconciled membership view and
//! fail with [`Error::Precondition`] before anything is signed or published.

pub mod groups;
pub mod invites;

pub use groups::CreateGroupParams;

use crate::client::GroupClient;
use crate::error::{Error, Result};

/// Role that grants moderation rights
pub const ADMIN_ROLE: &str = "admin";

/// Source label for events we authored and applied locally
pub(crate) const LOCAL_SOURCE: &str = "local";

impl GroupClient {
    pub(crate) async fn require_admin(&self, group_id: &str) -> Result<()> {
        let me = self.my_pubkey_hex();
        if self.state().await.membership.has_role(group_id, &me, ADMIN_ROLE) {
            Ok(())
        } else {
            Err(Error::Precondition(format!("Not an admin of {}", group_id)))
        }
    }

    pub(crate) async fn require_member(&self, group_id: &str) -> Result<()> {
        let me = self.my_pubkey_hex();
        if self.state().await.membership.is_member(group_id, &me) {
            Ok(())
        } else {
            Err(Error::Precondition(format!("Not a member of {}", group_id)))
        }
    }
}
