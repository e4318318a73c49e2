//! Process groups and sessions
//!
//! A group holds weak links to its member teams; each member holds a
//! counted reference to its group. Groups are published in a table keyed
//! by id and unpublish themselves when their last reference goes away.
//!
//! Groups can be queued for an orphan check. The queue has its own lock,
//! so scheduling a check never needs a group or team lock.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use super::lock::{Mutex, MutexGuard, RwSpinLock};
use super::lock_order::LockClass;
use super::referenceable::{KernelReferenceable, Lockable, Reference, ReferenceCount};
use super::signal::{SIGCONT, SIGHUP};
use super::team::{JobControlState, Team, TeamLockSet};
use crate::types::{Error, ProcessGroupId, Result, SessionId, TeamId};

// ============================================================================
// Session
// ============================================================================

/// Session state guarded by the session lock
#[derive(Debug, Default)]
pub struct SessionLocked {
    pub controlling_tty: Option<i32>,
    pub foreground_group: Option<ProcessGroupId>,
}

/// A login session: a set of process groups sharing a controlling terminal
pub struct ProcessSession {
    refs: ReferenceCount,
    id: SessionId,
    lock: Mutex<SessionLocked>,
}

impl ProcessSession {
    pub fn new(id: SessionId) -> Reference<Self> {
        Reference::new(Self {
            refs: ReferenceCount::new(),
            id,
            lock: Mutex::new(LockClass::Session, "session", SessionLocked::default()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionLocked> {
        self.lock.lock()
    }

    pub fn controlling_tty(&self) -> Option<i32> {
        self.lock.lock().controlling_tty
    }

    pub fn foreground_group(&self) -> Option<ProcessGroupId> {
        self.lock.lock().foreground_group
    }
}

impl KernelReferenceable for ProcessSession {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }
}

impl Lockable for ProcessSession {
    type Locked = SessionLocked;

    fn object_lock(&self) -> &Mutex<SessionLocked> {
        &self.lock
    }
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession").field("id", &self.id).finish()
    }
}

// ============================================================================
// Process Group
// ============================================================================

/// Group state guarded by the group lock
#[derive(Default)]
pub struct GroupLocked {
    teams: Vec<(TeamId, Weak<Team>)>,
}

impl GroupLocked {
    pub fn team_ids(&self) -> impl Iterator<Item = TeamId> + '_ {
        self.teams.iter().map(|(id, _)| *id)
    }

    /// Counted references to the members that are still alive
    pub fn teams(&self) -> Vec<Reference<Team>> {
        self.teams
            .iter()
            .filter_map(|(_, team)| Reference::upgrade(team))
            .collect()
    }

    pub fn contains(&self, team: TeamId) -> bool {
        self.teams.iter().any(|(id, _)| *id == team)
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}

struct GroupTable {
    groups: RwSpinLock<BTreeMap<ProcessGroupId, Weak<ProcessGroup>>>,
    orphaned_check: Mutex<Vec<Weak<ProcessGroup>>>,
}

/// A POSIX process group
pub struct ProcessGroup {
    refs: ReferenceCount,
    id: ProcessGroupId,
    this: Weak<ProcessGroup>,
    lock: Mutex<GroupLocked>,
    session: spin::Once<Reference<ProcessSession>>,
    table: Weak<GroupTable>,
    in_orphaned_check_list: AtomicBool,
}

impl ProcessGroup {
    fn new(id: ProcessGroupId, table: Weak<GroupTable>) -> Reference<Self> {
        Reference::new_cyclic(|this| Self {
            refs: ReferenceCount::new(),
            id,
            this: this.clone(),
            lock: Mutex::new(LockClass::ProcessGroup, "process group", GroupLocked::default()),
            session: spin::Once::new(),
            table,
            in_orphaned_check_list: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ProcessGroupId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, GroupLocked> {
        self.lock.lock()
    }

    pub fn session(&self) -> Option<&Reference<ProcessSession>> {
        self.session.get()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.get().map(|session| session.id())
    }

    /// Attach the group to `session` and make it findable by id
    ///
    /// Fails with [`Error::AlreadyExists`] if a live group already uses the
    /// id, or if the group was published before.
    pub fn publish(&self, session: &Reference<ProcessSession>) -> Result<()> {
        let table = self.table.upgrade().ok_or(Error::BadValue)?;
        let mut groups = table.groups.write();

        let taken = groups
            .get(&self.id)
            .and_then(Weak::upgrade)
            .is_some_and(|group| group.reference_count().count() > 0);
        if taken || self.session.get().is_some() {
            return Err(Error::AlreadyExists);
        }

        self.session.call_once(|| session.clone());
        groups.insert(self.id, self.this.clone());
        log::debug!("process group {} published in session {}", self.id, session.id());
        Ok(())
    }

    /// Add `team` to the group and record the group and session on the team
    ///
    /// The team must not be in a group. Takes the group lock, then the
    /// team lock.
    pub fn insert_team(this: &Reference<Self>, team: &Reference<Team>) -> Result<()> {
        let mut group_data = this.lock.lock();
        let mut team_data = team.lock();
        if team_data.group.is_some() {
            return Err(Error::AlreadyExists);
        }

        group_data.teams.push((team.id(), team.weak()));
        team_data.group = Some(this.clone());
        team_data.group_id = this.id;
        team_data.session_id = this.session_id().unwrap_or(SessionId(-1));
        Ok(())
    }

    /// Whether no member has a parent in another group of the same session
    ///
    /// Needs the group lock; `data` is the locked group state.
    pub fn is_orphaned(&self, data: &GroupLocked) -> bool {
        let Some(session) = self.session_id() else {
            return true;
        };
        for team in data.teams() {
            let set = TeamLockSet::lock_team_and_parent(&team, false);
            let anchored = set
                .parent_data()
                .is_some_and(|parent| parent.group_id() != self.id && parent.session_id() == session);
            if anchored {
                return false;
            }
        }
        true
    }

    /// Whether any member is stopped; needs the group lock
    pub fn has_stopped_members(&self, data: &GroupLocked) -> bool {
        data.teams()
            .iter()
            .any(|team| team.lock().job_control_state() == JobControlState::Stopped)
    }

    /// Queue the group for [`ProcessGroupRegistry::check_orphaned_process_groups`]
    pub fn schedule_orphaned_check(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut list = table.orphaned_check.lock();
        if !self.in_orphaned_check_list.swap(true, Ordering::AcqRel) {
            list.push(self.this.clone());
        }
    }

    /// Take the group off the orphan-check queue
    pub fn unset_orphaned_check(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut list = table.orphaned_check.lock();
        if self.in_orphaned_check_list.swap(false, Ordering::AcqRel) {
            list.retain(|group| !core::ptr::eq(group.as_ptr(), self));
        }
    }

    pub fn is_in_orphaned_check_list(&self) -> bool {
        self.in_orphaned_check_list.load(Ordering::Acquire)
    }
}

/// Take the team in `set` out of its group
///
/// `set` must hold the team and group locks. The group reference the
/// team held is returned; drop it after `set`.
pub fn remove_team_from_group(set: &mut TeamLockSet) -> Option<Reference<ProcessGroup>> {
    let team_id = set.team().id();
    let group = set.team_data_mut().group.take()?;
    set.team_data_mut().group_id = ProcessGroupId(-1);
    if let Some(group_data) = set.group_data_mut() {
        group_data.teams.retain(|(id, _)| *id != team_id);
    }
    Some(group)
}

impl KernelReferenceable for ProcessGroup {
    fn reference_count(&self) -> &ReferenceCount {
        &self.refs
    }

    fn last_reference_released(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        {
            let mut groups = table.groups.write();
            let published_as_self = groups
                .get(&self.id)
                .is_some_and(|group| core::ptr::eq(group.as_ptr(), self));
            if published_as_self {
                groups.remove(&self.id);
            }
        }
        if self.in_orphaned_check_list.swap(false, Ordering::AcqRel) {
            table
                .orphaned_check
                .lock()
                .retain(|group| !core::ptr::eq(group.as_ptr(), self));
        }
        log::debug!("process group {} released", self.id);
    }
}

impl Lockable for ProcessGroup {
    type Locked = GroupLocked;

    fn object_lock(&self) -> &Mutex<GroupLocked> {
        &self.lock
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("id", &self.id)
            .field("session", &self.session_id())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Published process groups and the orphan-check queue
pub struct ProcessGroupRegistry {
    table: Arc<GroupTable>,
}

impl ProcessGroupRegistry {
    pub fn new() -> Self {
        Self {
            table: Arc::new(GroupTable {
                groups: RwSpinLock::new(BTreeMap::new()),
                orphaned_check: Mutex::new(LockClass::OrphanedCheck, "orphaned check", Vec::new()),
            }),
        }
    }

    /// A new, unpublished group
    pub fn create(&self, id: ProcessGroupId) -> Reference<ProcessGroup> {
        ProcessGroup::new(id, Arc::downgrade(&self.table))
    }

    /// Look up a published group and reference it
    pub fn get(&self, id: ProcessGroupId) -> Option<Reference<ProcessGroup>> {
        let groups = self.table.groups.read();
        let group = groups.get(&id).and_then(Reference::upgrade);
        if group.is_none() {
            log::trace!("process group {} not found", id);
        }
        group
    }

    pub fn count(&self) -> usize {
        self.table.groups.read().len()
    }

    pub fn orphaned_check_count(&self) -> usize {
        self.table.orphaned_check.lock().len()
    }

    /// Drain the orphan-check queue
    ///
    /// Every queued group that is orphaned and has a stopped member gets
    /// SIGHUP and SIGCONT posted to all its members. Returns the number of
    /// groups signalled.
    pub fn check_orphaned_process_groups(&self) -> usize {
        let mut signalled = 0;
        loop {
            let next = {
                let mut list = self.table.orphaned_check.lock();
                if list.is_empty() {
                    break;
                }
                let weak = list.remove(0);
                let group = Reference::upgrade(&weak);
                if let Some(group) = &group {
                    group.in_orphaned_check_list.store(false, Ordering::Release);
                }
                group
            };
            let Some(group) = next else {
                continue;
            };

            let members = {
                let data = group.lock();
                if !group.is_orphaned(&data) || !group.has_stopped_members(&data) {
                    continue;
                }
                data.teams()
            };

            log::debug!("process group {} orphaned with stopped members", group.id());
            for team in &members {
                team.add_pending_signal(SIGHUP);
                team.add_pending_signal(SIGCONT);
            }
            signalled += 1;
        }
        signalled
    }
}

impl Default for ProcessGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kern::team::{TeamRegistry, TeamState};

    fn setup() -> (TeamRegistry, ProcessGroupRegistry) {
        let teams = TeamRegistry::new(&KernelConfig::default());
        teams.bootstrap().unwrap();
        (teams, ProcessGroupRegistry::new())
    }

    fn team(teams: &TeamRegistry, name: &str) -> Reference<Team> {
        let team = teams.create(name).unwrap();
        team.set_state(TeamState::Normal).unwrap();
        teams.insert(&team).unwrap();
        team
    }

    #[test]
    fn test_publish_and_get() {
        let (_, groups) = setup();
        let session = ProcessSession::new(SessionId(10));
        let group = groups.create(ProcessGroupId(10));
        assert!(groups.get(ProcessGroupId(10)).is_none());

        group.publish(&session).unwrap();
        assert_eq!(group.publish(&session), Err(Error::AlreadyExists));
        let found = groups.get(ProcessGroupId(10)).unwrap();
        assert!(Reference::ptr_eq(&found, &group));
        assert_eq!(found.session_id(), Some(SessionId(10)));

        let duplicate = groups.create(ProcessGroupId(10));
        assert_eq!(duplicate.publish(&session), Err(Error::AlreadyExists));
    }

    #[test]
    fn test_last_reference_unpublishes() {
        let (_, groups) = setup();
        let session = ProcessSession::new(SessionId(3));
        let group = groups.create(ProcessGroupId(3));
        group.publish(&session).unwrap();
        group.schedule_orphaned_check();
        assert_eq!(groups.count(), 1);
        assert_eq!(groups.orphaned_check_count(), 1);

        drop(group);
        assert_eq!(groups.count(), 0);
        assert_eq!(groups.orphaned_check_count(), 0);
        assert!(groups.get(ProcessGroupId(3)).is_none());
    }

    #[test]
    fn test_insert_and_remove_team() {
        let (teams, groups) = setup();
        let session = ProcessSession::new(SessionId(7));
        let group = groups.create(ProcessGroupId(7));
        group.publish(&session).unwrap();
        let member = team(&teams, "member");

        ProcessGroup::insert_team(&group, &member).unwrap();
        assert_eq!(ProcessGroup::insert_team(&group, &member), Err(Error::AlreadyExists));
        assert!(group.lock().contains(member.id()));
        assert_eq!(member.lock().group_id(), ProcessGroupId(7));
        assert_eq!(member.lock().session_id(), SessionId(7));

        let removed = {
            let mut set = TeamLockSet::lock_team_and_process_group(&member);
            assert!(set.group().is_some());
            remove_team_from_group(&mut set)
        };
        assert!(removed.is_some_and(|g| Reference::ptr_eq(&g, &group)));
        assert!(group.lock().is_empty());
        assert!(member.lock().group().is_none());
    }

    #[test]
    fn test_is_orphaned() {
        let (teams, groups) = setup();
        let session = ProcessSession::new(SessionId(20));
        let shell_group = groups.create(ProcessGroupId(20));
        let job_group = groups.create(ProcessGroupId(21));
        shell_group.publish(&session).unwrap();
        job_group.publish(&session).unwrap();

        let shell = team(&teams, "shell");
        let job = team(&teams, "job");
        shell.insert_child(&job);
        ProcessGroup::insert_team(&shell_group, &shell).unwrap();
        ProcessGroup::insert_team(&job_group, &job).unwrap();

        // The shell anchors the job's group; nothing anchors the shell's
        assert!(!job_group.is_orphaned(&job_group.lock()));
        assert!(shell_group.is_orphaned(&shell_group.lock()));

        shell.remove_child(job.id()).unwrap();
        assert!(job_group.is_orphaned(&job_group.lock()));
    }

    #[test]
    fn test_orphan_check_signals_stopped_groups() {
        let (teams, groups) = setup();
        let session = ProcessSession::new(SessionId(30));
        let group = groups.create(ProcessGroupId(30));
        group.publish(&session).unwrap();
        let stopped = team(&teams, "stopped");
        let running = team(&teams, "running");
        ProcessGroup::insert_team(&group, &stopped).unwrap();
        ProcessGroup::insert_team(&group, &running).unwrap();

        group.schedule_orphaned_check();
        group.schedule_orphaned_check();
        assert_eq!(groups.orphaned_check_count(), 1);
        assert_eq!(groups.check_orphaned_process_groups(), 0);
        assert!(!group.is_in_orphaned_check_list());

        TeamLockSet::lock_team_and_parent(&stopped, false)
            .set_job_control_state(JobControlState::Stopped, None);
        group.schedule_orphaned_check();
        assert_eq!(groups.check_orphaned_process_groups(), 1);
        for member in [&stopped, &running] {
            let pending = member.pending_signals();
            assert!(pending.contains(SIGHUP));
            assert!(pending.contains(SIGCONT));
        }
    }

    #[test]
    fn test_session_state() {
        let session = ProcessSession::new(SessionId(5));
        {
            let mut locked = session.lock();
            locked.controlling_tty = Some(2);
            locked.foreground_group = Some(ProcessGroupId(5));
        }
        assert_eq!(session.controlling_tty(), Some(2));
        assert_eq!(session.foreground_group(), Some(ProcessGroupId(5)));
    }
}
