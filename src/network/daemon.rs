use std::collections::{BTreeMap, HashMap};

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, info, warn};

use super::{
    EventStream, GroupConnection, GroupEvent, Guarantee, MemberId, MembershipCause, MembershipInfo,
    VirtualSynchronySet,
};
use crate::common::{Error, Result};

/*
    A single sequencer task owns every group. Requests are handled one at a
    time and each resulting event is pushed to the member queues before the
    next request is looked at, so all members of a group observe messages and
    membership changes in one total order. This is at least as strong as the
    safe guarantee; weaker guarantees are served the same way.
*/

type Reply = oneshot::Sender<Result<()>>;

enum Request {
    Connect {
        member: MemberId,
        events: UnboundedSender<GroupEvent>,
        reply: Reply,
    },
    Join {
        member: MemberId,
        group: String,
        reply: Reply,
    },
    Leave {
        member: MemberId,
        group: String,
        reply: Reply,
    },
    Multicast {
        member: MemberId,
        group: String,
        guarantee: Guarantee,
        payload: Vec<u8>,
        reply: Reply,
    },
    Disconnect {
        member: MemberId,
        reply: Option<Reply>,
    },
    NetworkChange {
        group: String,
        sets: Vec<Vec<MemberId>>,
        reply: Reply,
    },
}

#[derive(Default)]
struct GroupState {
    members: Vec<MemberId>,
    view_id: u64,
}

/// Handle to an in-process group communication daemon.
#[derive(Clone)]
pub struct Daemon {
    requests: UnboundedSender<Request>,
}

impl Daemon {
    /// Start the sequencer on the current tokio runtime.
    pub fn spawn() -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer {
            requests: rx,
            connections: HashMap::new(),
            groups: BTreeMap::new(),
        };
        tokio::spawn(sequencer.run());
        Daemon { requests }
    }

    pub async fn connect(&self, name: impl Into<String>) -> Result<(LocalConnection, EventStream)> {
        let member = MemberId::new(name);
        let (events, stream) = mpsc::unbounded_channel();
        self.request(|reply| Request::Connect {
            member: member.clone(),
            events,
            reply,
        })
        .await?;
        let connection = LocalConnection {
            member,
            daemon: self.clone(),
        };
        Ok((connection, stream))
    }

    /// Deliver a network-caused membership to every member of `group`.
    ///
    /// `sets` lists the virtual synchrony sets that came together in the new
    /// view. Every listed member must currently belong to the group.
    pub async fn network_change(&self, group: &str, sets: Vec<Vec<MemberId>>) -> Result<()> {
        self.request(|reply| Request::NetworkChange {
            group: group.to_string(),
            sets,
            reply,
        })
        .await
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Request) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .map_err(|_| Error::Connection("daemon stopped".into()))?;
        response
            .await
            .map_err(|_| Error::Connection("daemon stopped".into()))?
    }
}

/// A member's connection to a [`Daemon`]. Dropping it disconnects the member.
pub struct LocalConnection {
    member: MemberId,
    daemon: Daemon,
}

impl GroupConnection for LocalConnection {
    fn member(&self) -> &MemberId {
        &self.member
    }

    async fn join(&self, group: &str) -> Result<()> {
        self.daemon
            .request(|reply| Request::Join {
                member: self.member.clone(),
                group: group.to_string(),
                reply,
            })
            .await
    }

    async fn leave(&self, group: &str) -> Result<()> {
        self.daemon
            .request(|reply| Request::Leave {
                member: self.member.clone(),
                group: group.to_string(),
                reply,
            })
            .await
    }

    async fn multicast(&self, group: &str, guarantee: Guarantee, payload: Vec<u8>) -> Result<()> {
        self.daemon
            .request(|reply| Request::Multicast {
                member: self.member.clone(),
                group: group.to_string(),
                guarantee,
                payload,
                reply,
            })
            .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.daemon
            .request(|reply| Request::Disconnect {
                member: self.member.clone(),
                reply: Some(reply),
            })
            .await
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        let _ = self.daemon.requests.send(Request::Disconnect {
            member: self.member.clone(),
            reply: None,
        });
    }
}

struct Sequencer {
    requests: UnboundedReceiver<Request>,
    connections: HashMap<MemberId, UnboundedSender<GroupEvent>>,
    groups: BTreeMap<String, GroupState>,
}

impl Sequencer {
    async fn run(mut self) {
        debug!("sequencer started");
        while let Some(request) = self.requests.recv().await {
            match request {
                Request::Connect {
                    member,
                    events,
                    reply,
                } => {
                    let _ = reply.send(self.connect(member, events));
                }
                Request::Join {
                    member,
                    group,
                    reply,
                } => {
                    let _ = reply.send(self.join(member, group));
                }
                Request::Leave {
                    member,
                    group,
                    reply,
                } => {
                    let _ = reply.send(self.leave(member, group));
                }
                Request::Multicast {
                    member,
                    group,
                    guarantee,
                    payload,
                    reply,
                } => {
                    let _ = reply.send(self.multicast(member, group, guarantee, payload));
                }
                Request::Disconnect { member, reply } => {
                    self.disconnect(&member);
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Request::NetworkChange { group, sets, reply } => {
                    let _ = reply.send(self.network_change(group, sets));
                }
            }
        }
        debug!("sequencer stopped");
    }

    fn connect(&mut self, member: MemberId, events: UnboundedSender<GroupEvent>) -> Result<()> {
        if self.connections.contains_key(&member) {
            warn!(%member, "rejected duplicate member name");
            return Err(Error::DuplicateMember(member));
        }
        info!(%member, "member connected");
        self.connections.insert(member, events);
        Ok(())
    }

    fn join(&mut self, member: MemberId, group: String) -> Result<()> {
        self.ensure_connected(&member)?;
        let state = self.groups.entry(group.clone()).or_default();
        if state.members.contains(&member) {
            return Err(Error::Group {
                group,
                reason: format!("{member} is already a member"),
            });
        }
        state.members.push(member.clone());
        info!(%member, %group, "member joined");
        self.install_view(&group, MembershipCause::Join(member));
        Ok(())
    }

    fn leave(&mut self, member: MemberId, group: String) -> Result<()> {
        self.ensure_connected(&member)?;
        if !self.remove_member(&group, &member) {
            return Err(Error::Group {
                group,
                reason: format!("{member} is not a member"),
            });
        }
        info!(%member, %group, "member left");
        self.send_to(&member, GroupEvent::SelfLeave { group: group.clone() });
        self.install_view(&group, MembershipCause::Leave(member));
        Ok(())
    }

    fn multicast(
        &mut self,
        member: MemberId,
        group: String,
        guarantee: Guarantee,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !self.connections.contains_key(&member) {
            return Err(Error::Multicast {
                group,
                reason: format!("{member} is not connected"),
            });
        }
        let Some(state) = self.groups.get(&group) else {
            // Nobody to deliver to
            return Ok(());
        };
        let event = GroupEvent::Message {
            group: group.clone(),
            sender: member,
            guarantee,
            payload,
        };
        for receiver in state.members.clone() {
            self.send_to(&receiver, event.clone());
        }
        Ok(())
    }

    fn disconnect(&mut self, member: &MemberId) {
        if self.connections.remove(member).is_none() {
            return;
        }
        info!(%member, "member disconnected");
        let groups: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, state)| state.members.contains(member))
            .map(|(name, _)| name.clone())
            .collect();
        for group in groups {
            self.remove_member(&group, member);
            self.install_view(&group, MembershipCause::Disconnect(member.clone()));
        }
    }

    fn network_change(&mut self, group: String, sets: Vec<Vec<MemberId>>) -> Result<()> {
        let Some(state) = self.groups.get(&group) else {
            return Err(Error::Group {
                group,
                reason: "no such group".into(),
            });
        };
        if let Some(stranger) = sets.iter().flatten().find(|m| !state.members.contains(m)) {
            return Err(Error::Group {
                group,
                reason: format!("{stranger} is not a member"),
            });
        }
        let members = state.members.clone();
        for member in &members {
            self.send_to(member, GroupEvent::Transitional { group: group.clone() });
        }

        let state = self.groups.entry(group.clone()).or_default();
        state.view_id += 1;
        let view_id = state.view_id;
        for member in &members {
            let local_sets = sets
                .iter()
                .map(|set| VirtualSynchronySet {
                    members: set.clone(),
                    local: set.contains(member),
                })
                .collect();
            let info = MembershipInfo {
                group: group.clone(),
                view_id,
                members: members.clone(),
                cause: MembershipCause::Network(local_sets),
            };
            self.send_to(member, GroupEvent::Membership(info));
        }
        info!(%group, view_id, sets = sets.len(), "network change delivered");
        Ok(())
    }

    fn install_view(&mut self, group: &str, cause: MembershipCause) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        if state.members.is_empty() {
            self.groups.remove(group);
            return;
        }
        state.view_id += 1;
        let info = MembershipInfo {
            group: group.to_string(),
            view_id: state.view_id,
            members: state.members.clone(),
            cause,
        };
        for member in info.members.clone() {
            self.send_to(&member, GroupEvent::Membership(info.clone()));
        }
    }

    fn remove_member(&mut self, group: &str, member: &MemberId) -> bool {
        match self.groups.get_mut(group) {
            Some(state) => {
                let before = state.members.len();
                state.members.retain(|m| m != member);
                state.members.len() != before
            }
            None => false,
        }
    }

    fn ensure_connected(&self, member: &MemberId) -> Result<()> {
        if self.connections.contains_key(member) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn send_to(&self, member: &MemberId, event: GroupEvent) {
        if let Some(events) = self.connections.get(member) {
            // A closed stream only means the member stopped reading
            let _ = events.send(event);
        }
    }
}
