use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    error::{Error, RoomErrorKind, TransportErrorKind},
    signaling::message::SignalMsg,
};

/// A live signaling connection that can receive envelopes.
pub trait RoomMember: Send + Sync + fmt::Debug {
    /// Queues `text` for delivery. Must not block.
    fn send_text(&self, text: String) -> Result<(), Error>;

    /// Asks the connection to shut down.
    fn close(&self);
}

#[derive(Debug)]
struct Membership {
    connection_id: String,
    member: Arc<dyn RoomMember>,
}

/// RoomRegistry maps room ids to the users connected in them. All membership changes happen under one
/// mutex; envelope writes happen outside it on a snapshot of the membership.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, HashMap<String, Membership>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `user_id` to `room_id` and sends the connected acknowledgement before releasing the lock.
    /// A previous connection of the same user is closed and replaced. Returns the member count.
    pub fn join(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: &str,
        member: Arc<dyn RoomMember>,
    ) -> usize {
        let mut rooms = match self.rooms.lock() {
            Ok(rooms) => rooms,
            Err(poisoned) => poisoned.into_inner(),
        };
        let room = rooms.entry(room_id.to_owned()).or_insert_with(|| {
            tracing::debug!("Room room_id={} is created", room_id);
            HashMap::new()
        });

        if let Some(previous) = room.insert(
            user_id.to_owned(),
            Membership {
                connection_id: connection_id.to_owned(),
                member: member.clone(),
            },
        ) {
            tracing::warn!(
                "user_id={} re-joined room_id={}, closing connection_id={}",
                user_id,
                room_id,
                previous.connection_id
            );
            previous.member.close();
        }

        let count = room.len();
        match SignalMsg::connected(room_id, count).to_json() {
            Ok(ack) => {
                if let Err(err) = member.send_text(ack) {
                    tracing::error!("Failed to acknowledge user_id={}: {}", user_id, err);
                }
            }
            Err(err) => tracing::error!("Failed to encode acknowledgement: {}", err),
        }

        tracing::info!("[{}] {} joined, members={}", room_id, user_id, count);
        count
    }

    /// Removes the membership only if it still belongs to `connection_id`, and drops the room once it is
    /// empty. Returns whether anything was removed.
    pub fn leave(&self, room_id: &str, user_id: &str, connection_id: &str) -> bool {
        let mut rooms = match self.rooms.lock() {
            Ok(rooms) => rooms,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };

        let owned = room
            .get(user_id)
            .map(|m| m.connection_id == connection_id)
            .unwrap_or(false);
        if owned {
            room.remove(user_id);
            tracing::info!("[{}] {} left", room_id, user_id);
        }
        if room.is_empty() {
            rooms.remove(room_id);
            tracing::debug!("Room room_id={} is removed", room_id);
        }
        owned
    }

    /// Delivers `msg` inside its room: to every member except the sender when it has no recipient, or to
    /// exactly the named recipient. Returns the number of members written to.
    pub fn route(&self, msg: &SignalMsg) -> Result<usize, Error> {
        let room_id = msg.room_id.as_deref().unwrap_or_default();
        let members = self.snapshot(room_id).ok_or_else(|| {
            Error::new_room(
                format!("Room {} not found", room_id),
                RoomErrorKind::RoomNotFoundError,
            )
        })?;
        let data = msg.to_json()?;

        match msg.recipient() {
            None => {
                let mut delivered = 0;
                for (user_id, member) in members.iter() {
                    if *user_id == msg.from {
                        continue;
                    }
                    match member.send_text(data.clone()) {
                        Ok(()) => delivered += 1,
                        Err(err) => {
                            tracing::warn!("Failed to send message to {}: {}", user_id, err)
                        }
                    }
                }
                Ok(delivered)
            }
            Some(to) => {
                let member = members
                    .iter()
                    .find(|(user_id, _)| user_id == to)
                    .map(|(_, member)| member)
                    .ok_or_else(|| {
                        Error::new_room(
                            format!("Failed to send message to {}", to),
                            RoomErrorKind::RecipientNotFoundError,
                        )
                    })?;
                member.send_text(data).map_err(|err| {
                    Error::new_transport(
                        format!("Failed to send message to {}: {}", to, err),
                        TransportErrorKind::ClosedError,
                    )
                })?;
                Ok(1)
            }
        }
    }

    fn snapshot(&self, room_id: &str) -> Option<Vec<(String, Arc<dyn RoomMember>)>> {
        let rooms = match self.rooms.lock() {
            Ok(rooms) => rooms,
            Err(poisoned) => poisoned.into_inner(),
        };
        rooms.get(room_id).map(|room| {
            room.iter()
                .map(|(user_id, m)| (user_id.clone(), m.member.clone()))
                .collect()
        })
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .snapshot(room_id)
            .unwrap_or_default()
            .into_iter()
            .map(|(user_id, _)| user_id)
            .collect();
        users.sort();
        users
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.snapshot(room_id).is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signaling::message::{SignalBody, SERVER_ID};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    pub(crate) struct FakeMember {
        pub(crate) inbox: Mutex<Vec<String>>,
        pub(crate) closed: AtomicBool,
    }

    impl FakeMember {
        pub(crate) fn received(&self) -> Vec<SignalMsg> {
            self.inbox
                .lock()
                .unwrap()
                .iter()
                .map(|text| SignalMsg::from_json(text).unwrap())
                .collect()
        }
    }

    impl RoomMember for FakeMember {
        fn send_text(&self, text: String) -> Result<(), Error> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::new_transport(
                    "closed".to_string(),
                    TransportErrorKind::ClosedError,
                ));
            }
            self.inbox.lock().unwrap().push(text);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn text(from: &str, to: Option<&str>, body: &str) -> SignalMsg {
        let mut msg = SignalMsg::new(from, Some("R1".to_string()), body.into());
        msg.to = to.map(|t| t.to_string());
        msg
    }

    #[test]
    fn join_acknowledges_with_member_count() {
        let registry = RoomRegistry::new();
        let alice = Arc::new(FakeMember::default());
        let bob = Arc::new(FakeMember::default());

        assert_eq!(registry.join("R1", "alice", "c1", alice.clone()), 1);
        assert_eq!(registry.join("R1", "bob", "c2", bob.clone()), 2);

        let ack = &bob.received()[0];
        assert_eq!(ack.status, Some(200));
        assert_eq!(ack.from, SERVER_ID);
        assert!(matches!(ack.body().unwrap(), SignalBody::Connected(2)));
    }

    #[test]
    fn broadcast_skips_sender_and_rooms_are_cleaned_up() {
        let registry = RoomRegistry::new();
        let alice = Arc::new(FakeMember::default());
        let bob = Arc::new(FakeMember::default());
        registry.join("R1", "alice", "c1", alice.clone());
        registry.join("R1", "bob", "c2", bob.clone());

        assert_eq!(registry.route(&text("alice", None, "hello")).unwrap(), 1);
        assert_eq!(bob.received().last().unwrap().text(), Some("hello"));
        assert_eq!(alice.received().len(), 1);

        assert!(registry.leave("R1", "alice", "c1"));
        assert!(registry.leave("R1", "bob", "c2"));
        assert!(!registry.contains_room("R1"));
        assert!(!registry.leave("R1", "bob", "c2"));
    }

    #[test]
    fn directed_send_after_other_member_left() {
        let registry = RoomRegistry::new();
        let a = Arc::new(FakeMember::default());
        let b = Arc::new(FakeMember::default());
        let c = Arc::new(FakeMember::default());
        registry.join("R1", "a", "c1", a.clone());
        registry.join("R1", "b", "c2", b.clone());
        registry.join("R1", "c", "c3", c.clone());
        registry.leave("R1", "a", "c1");

        assert_eq!(registry.route(&text("c", Some("b"), "direct")).unwrap(), 1);
        assert_eq!(b.received().last().unwrap().text(), Some("direct"));

        let before = a.received().len();
        assert_eq!(registry.route(&text("b", None, "all")).unwrap(), 1);
        assert_eq!(a.received().len(), before);
    }

    #[test]
    fn directed_send_to_absent_user_fails() {
        let registry = RoomRegistry::new();
        registry.join("R1", "a", "c1", Arc::new(FakeMember::default()));

        let err = registry.route(&text("a", Some("ghost"), "x")).unwrap_err();
        assert_eq!(err.room_kind(), Some(&RoomErrorKind::RecipientNotFoundError));

        let mut msg = text("a", None, "x");
        msg.room_id = Some("nowhere".to_string());
        let err = registry.route(&msg).unwrap_err();
        assert_eq!(err.room_kind(), Some(&RoomErrorKind::RoomNotFoundError));
    }

    #[test]
    fn rejoin_closes_previous_connection_and_keeps_new_one() {
        let registry = RoomRegistry::new();
        let first = Arc::new(FakeMember::default());
        let second = Arc::new(FakeMember::default());
        registry.join("R1", "uav", "c1", first.clone());
        assert_eq!(registry.join("R1", "uav", "c2", second.clone()), 1);
        assert!(first.closed.load(Ordering::SeqCst));

        // Teardown of the old connection must not evict the new one.
        assert!(!registry.leave("R1", "uav", "c1"));
        assert_eq!(registry.members("R1"), vec!["uav".to_string()]);
        assert!(registry.leave("R1", "uav", "c2"));
    }
}
