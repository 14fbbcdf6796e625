//! Channels and rooms.
//!
//! Channels are fixed groups configured at startup. Rooms are created at
//! runtime inside a channel by a peer, who becomes the room's owner. A
//! peer belongs to at most one group at a time; leaving a room drops the
//! peer back into the room's parent channel. A room whose owner departs is
//! closed: current members stay until they leave, new joins are refused,
//! and the room is removed once empty.

use std::collections::{HashMap, HashSet};

use pulsar_proto::{PeerId, RoomInfo, RoomOptions};
use tracing::debug;

/// Room ids start here so they never collide with configured channel ids.
const FIRST_ROOM_ID: u32 = 1_000;

/// Whether a group is a configured channel or a runtime room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Channel,
    Room,
}

/// Errors raised by group operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GroupError {
    /// No group exists with the given id.
    #[error("no group with id {group_id}")]
    NotFound { group_id: u32 },

    /// The group is at capacity.
    #[error("group {group_id} is full ({max_peers} peers)")]
    Full { group_id: u32, max_peers: u16 },

    /// The room's owner has departed and the room accepts no new members.
    #[error("room {group_id} is closed")]
    Closed { group_id: u32 },

    /// The peer is already a member of this group.
    #[error("{peer} is already in group {group_id}")]
    AlreadyMember { peer: PeerId, group_id: u32 },

    /// The supplied password did not match.
    #[error("wrong password for group {group_id}")]
    WrongPassword { group_id: u32 },

    /// The peer is not in any group.
    #[error("{peer} is not in a group")]
    NotAMember { peer: PeerId },

    /// Room creation requires the creator to be in a channel first.
    #[error("{peer} must join a channel before creating a room")]
    NotInChannel { peer: PeerId },
}

#[derive(Debug)]
struct Group {
    id: u32,
    kind: GroupKind,
    name: String,
    max_peers: u16,
    password: String,
    visible: bool,
    properties: String,
    owner: Option<PeerId>,
    parent: Option<u32>,
    closed: bool,
    members: HashSet<PeerId>,
}

/// All channels and rooms, plus each peer's current membership.
#[derive(Default)]
pub struct GroupTable {
    groups: HashMap<u32, Group>,
    membership: HashMap<PeerId, u32>,
    next_room_id: u32,
}

impl GroupTable {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            membership: HashMap::new(),
            next_room_id: FIRST_ROOM_ID,
        }
    }

    /// Register a configured channel. Channels have no password, no owner,
    /// and never close.
    pub fn add_channel(&mut self, id: u32, name: &str, max_peers: u16) {
        self.groups.insert(
            id,
            Group {
                id,
                kind: GroupKind::Channel,
                name: name.to_string(),
                max_peers,
                password: String::new(),
                visible: true,
                properties: String::new(),
                owner: None,
                parent: None,
                closed: false,
                members: HashSet::new(),
            },
        );
    }

    /// Join a group by id. Moves the peer out of its current group first,
    /// so a failed join never strands a peer half-moved.
    pub fn join(&mut self, peer: PeerId, group_id: u32, password: &str) -> Result<(), GroupError> {
        {
            let group = self
                .groups
                .get(&group_id)
                .ok_or(GroupError::NotFound { group_id })?;
            if group.members.contains(&peer) {
                return Err(GroupError::AlreadyMember { peer, group_id });
            }
            if group.closed {
                return Err(GroupError::Closed { group_id });
            }
            if group.max_peers > 0 && group.members.len() >= usize::from(group.max_peers) {
                return Err(GroupError::Full {
                    group_id,
                    max_peers: group.max_peers,
                });
            }
            if !group.password.is_empty() && group.password != password {
                return Err(GroupError::WrongPassword { group_id });
            }
        }

        self.detach(peer);
        self.attach(peer, group_id);
        Ok(())
    }

    /// Create a room in the creator's current channel and move the creator
    /// into it as owner.
    pub fn create_room(&mut self, owner: PeerId, options: RoomOptions) -> Result<u32, GroupError> {
        let channel_id = match self.membership.get(&owner) {
            Some(&id) if self.groups[&id].kind == GroupKind::Channel => id,
            _ => return Err(GroupError::NotInChannel { peer: owner }),
        };

        let room_id = self.next_room_id;
        self.next_room_id += 1;
        self.groups.insert(
            room_id,
            Group {
                id: room_id,
                kind: GroupKind::Room,
                name: options.name,
                max_peers: options.max_peers,
                password: options.password,
                visible: options.visible,
                properties: options.properties,
                owner: Some(owner),
                parent: Some(channel_id),
                closed: false,
                members: HashSet::new(),
            },
        );

        self.detach(owner);
        self.attach(owner, room_id);
        debug!(room_id, %owner, "room created");
        Ok(room_id)
    }

    /// Leave the current group. Leaving a room drops the peer back into the
    /// room's parent channel.
    pub fn leave(&mut self, peer: PeerId) -> Result<(), GroupError> {
        let group_id = *self
            .membership
            .get(&peer)
            .ok_or(GroupError::NotAMember { peer })?;
        let parent = self.groups.get(&group_id).and_then(|g| g.parent);

        self.detach(peer);
        if let Some(channel_id) = parent {
            if self.groups.contains_key(&channel_id) {
                self.attach(peer, channel_id);
            }
        }
        Ok(())
    }

    /// Remove a departing peer from the table entirely.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.detach(peer);
    }

    /// The peer's current group, if any.
    pub fn group_of(&self, peer: PeerId) -> Option<u32> {
        self.membership.get(&peer).copied()
    }

    /// The peers sharing a group with `peer`, including `peer` itself.
    /// Empty when the peer is in no group.
    pub fn members_with(&self, peer: PeerId) -> Vec<PeerId> {
        match self.membership.get(&peer) {
            Some(group_id) => {
                let mut members: Vec<_> =
                    self.groups[group_id].members.iter().copied().collect();
                members.sort();
                members
            }
            None => Vec::new(),
        }
    }

    /// Visible rooms for the directory.
    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<_> = self
            .groups
            .values()
            .filter(|g| g.kind == GroupKind::Room && g.visible && !g.closed)
            .map(|g| RoomInfo {
                group_id: g.id,
                name: g.name.clone(),
                peer_count: g.members.len() as u16,
                max_peers: g.max_peers,
                has_password: !g.password.is_empty(),
                visible: g.visible,
                properties: g.properties.clone(),
            })
            .collect();
        rooms.sort_by_key(|r| r.group_id);
        rooms
    }

    fn attach(&mut self, peer: PeerId, group_id: u32) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.members.insert(peer);
            self.membership.insert(peer, group_id);
        }
    }

    /// Remove the peer from its current group, closing or reaping the
    /// group's room as needed.
    fn detach(&mut self, peer: PeerId) {
        let Some(group_id) = self.membership.remove(&peer) else {
            return;
        };
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        group.members.remove(&peer);

        if group.kind == GroupKind::Room {
            if group.owner == Some(peer) {
                group.closed = true;
                debug!(group_id, "room closed, owner departed");
            }
            if group.members.is_empty() {
                self.groups.remove(&group_id);
                debug!(group_id, "empty room removed");
            }
        }
    }
}
