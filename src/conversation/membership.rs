use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Conversation, ConversationId, PartitionKey, UserId};
use crate::error::StoreResult;
use crate::store::{DocumentStore, MembershipFeed};

/// Works out which partitions make up a conversation.
///
/// Direct conversations always map to the same two outboxes. Group
/// conversations map to one outbox per member, read from the group record.
#[derive(Clone)]
pub struct MembershipResolver {
    store: Arc<dyn DocumentStore>,
}

impl MembershipResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        me: &UserId,
        conversation: &Conversation,
    ) -> StoreResult<BTreeSet<PartitionKey>> {
        match conversation {
            Conversation::Direct { peer } => Ok(direct_partitions(me, peer)),
            Conversation::Group { group } => {
                let members = self.store.read_membership(group).await?;
                match members {
                    Some(members) => {
                        debug!(%group, members = members.len(), "group membership resolved");
                        Ok(group_partitions(group, &members))
                    }
                    None => {
                        info!(%group, "group record not found, no partitions to watch");
                        Ok(BTreeSet::new())
                    }
                }
            }
        }
    }

    /// Membership changes for a group, if the store can push them. Direct
    /// conversations have nothing to watch.
    pub async fn watch(&self, conversation: &Conversation) -> StoreResult<Option<MembershipFeed>> {
        match conversation {
            Conversation::Direct { .. } => Ok(None),
            Conversation::Group { group } => self.store.watch_membership(group).await,
        }
    }
}

pub(crate) fn direct_partitions(me: &UserId, peer: &UserId) -> BTreeSet<PartitionKey> {
    let mut keys = BTreeSet::new();
    keys.insert(PartitionKey::new(ConversationId::from(peer), me.clone()));
    keys.insert(PartitionKey::new(ConversationId::from(me), peer.clone()));
    keys
}

pub(crate) fn group_partitions(group: &ConversationId, members: &[UserId]) -> BTreeSet<PartitionKey> {
    members
        .iter()
        .map(|member| PartitionKey::new(group.clone(), member.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn direct_conversation_watches_both_outboxes() {
        let resolver = MembershipResolver::new(Arc::new(MemoryStore::new()));
        let me = UserId::new("a@x.io");

        let keys = resolver.resolve(&me, &Conversation::direct("b@x.io")).await.unwrap();

        let expected: BTreeSet<_> = [
            PartitionKey::new(ConversationId::new("b@x.io"), UserId::new("a@x.io")),
            PartitionKey::new(ConversationId::new("a@x.io"), UserId::new("b@x.io")),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn group_conversation_watches_each_member() {
        let store = MemoryStore::new();
        let group = ConversationId::new("crew");
        store.set_members(&group, vec![UserId::new("x"), UserId::new("y"), UserId::new("z")]);
        let resolver = MembershipResolver::new(Arc::new(store));

        let keys = resolver
            .resolve(&UserId::new("x"), &Conversation::group("crew"))
            .await
            .unwrap();

        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|key| key.conversation == group));
    }

    #[tokio::test]
    async fn missing_group_resolves_to_nothing() {
        let resolver = MembershipResolver::new(Arc::new(MemoryStore::new()));

        let keys = resolver
            .resolve(&UserId::new("x"), &Conversation::group("ghost"))
            .await
            .unwrap();

        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn direct_conversations_have_no_membership_feed() {
        let resolver = MembershipResolver::new(Arc::new(MemoryStore::new()));
        assert!(resolver.watch(&Conversation::direct("b")).await.unwrap().is_none());
        assert!(resolver.watch(&Conversation::group("g")).await.unwrap().is_some());
    }
}
