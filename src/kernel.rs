//! The kernel core service object
//!
//! [`KernelCore`] owns every registry and the physical page store, and
//! implements the operations that span several of them: creating and
//! tearing down teams and threads, job control, sessions and process
//! groups, and area creation and deletion.
//!
//! The boot path installs one instance with [`init`] and reaches it
//! through [`kernel`]. Tests build private instances.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::config::{KernelConfig, KERNEL_AREA_BASE, PAGE_SIZE, USER_AREA_BASE};
use crate::kern::cpu::Timeout;
use crate::kern::process_group::{remove_team_from_group, ProcessGroup, ProcessGroupRegistry, ProcessSession};
use crate::kern::referenceable::Reference;
use crate::kern::signal::{Signal, SIGCHLD, SIGCONT, SIGSTOP, SI_USER};
use crate::kern::team::{
    ChildEvent, JobControlEntry, JobControlState, Team, TeamExitInfo, TeamLockSet, TeamRegistry, TeamState,
    WaitFlags, KERNEL_TEAM_ID,
};
use crate::kern::thread::{KernelStack, Thread, ThreadExitReason, ThreadExitStatus, ThreadRegistry};
use crate::types::{Addr, AreaId, Error, ProcessGroupId, Result, SessionId, SignalNumber, TeamId, ThreadId};
use crate::vm::address_space::VmAddressSpace;
use crate::vm::area::{page_align, AreaSpec, MemoryType, Protection, UnwiredWaiter, VmArea, Wiring};
use crate::vm::areas::VmAreas;
use crate::vm::cache::{CacheLocker, CacheType, VmCache};
use crate::vm::page::{PageRef, PageState, PageStore, PhysicalPageService};
use crate::vm::soft_map::SoftTranslationMap;
use crate::vm::translation_map::map_page;

/// Everything the kernel core owns
pub struct KernelCore {
    config: KernelConfig,
    teams: TeamRegistry,
    threads: ThreadRegistry,
    groups: ProcessGroupRegistry,
    areas: VmAreas,
    pages: Arc<PageStore>,
    kernel_team: Reference<Team>,
}

impl KernelCore {
    /// Build a core with the kernel team, its session, group and address space
    pub fn new(config: KernelConfig) -> Result<Self> {
        let teams = TeamRegistry::new(&config);
        let kernel_team = teams.bootstrap()?;
        let pages = Arc::new(PageStore::new());

        let map = Arc::new(SoftTranslationMap::new(pages.clone(), true));
        kernel_team.set_address_space(Some(VmAddressSpace::new(KERNEL_TEAM_ID, true, map)));

        let groups = ProcessGroupRegistry::new();
        let session = ProcessSession::new(SessionId(KERNEL_TEAM_ID.0));
        let group = groups.create(ProcessGroupId(KERNEL_TEAM_ID.0));
        group.publish(&session)?;
        ProcessGroup::insert_team(&group, &kernel_team)?;

        log::info!(
            "kernel core up: {} teams, {} threads, {} areas max",
            config.max_teams,
            config.max_threads,
            config.max_areas
        );
        Ok(Self {
            config,
            teams,
            threads: ThreadRegistry::new(config.max_threads),
            groups,
            areas: VmAreas::new(config.max_areas),
            pages,
            kernel_team,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn teams(&self) -> &TeamRegistry {
        &self.teams
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn groups(&self) -> &ProcessGroupRegistry {
        &self.groups
    }

    pub fn areas(&self) -> &VmAreas {
        &self.areas
    }

    pub fn pages(&self) -> &Arc<PageStore> {
        &self.pages
    }

    pub fn kernel_team(&self) -> &Reference<Team> {
        &self.kernel_team
    }

    // === Teams ===

    /// Create a team as a child of `parent`, in the parent's process group
    pub fn create_team(&self, parent: TeamId, name: &str) -> Result<Reference<Team>> {
        let parent = self.teams.get(parent).ok_or(Error::BadTeamId)?;
        if parent.state().is_dying() {
            return Err(Error::BadTeamId);
        }

        let team = self.teams.create(name)?;
        let map = Arc::new(SoftTranslationMap::new(self.pages.clone(), false));
        team.set_address_space(Some(VmAddressSpace::new(team.id(), false, map)));

        let group = parent.lock().group().cloned();
        if let Some(group) = &group {
            ProcessGroup::insert_team(group, &team)?;
        }
        drop(group);

        parent.insert_child(&team);
        team.set_state(TeamState::Normal)?;
        if let Err(error) = self.teams.insert(&team) {
            parent.remove_child(team.id());
            return Err(error);
        }
        log::debug!("team {} ({}) created, parent {}", team.id(), name, parent.id());
        Ok(team)
    }

    /// Tear a team down
    ///
    /// The team goes through `Shutdown`: its threads exit, its timers go,
    /// and its areas go once nothing in them is wired any more. Its parent
    /// gets a `Dead` job-control entry and SIGCHLD, unless the parent is
    /// the kernel team, and its children move to the kernel team. It ends
    /// in `Death`, unpublished.
    pub fn exit_team(&self, id: TeamId, status: i32, reason: ChildEvent, signal: SignalNumber) -> Result<()> {
        let team = self.teams.get(id).ok_or(Error::BadTeamId)?;
        if team.is_kernel() {
            return Err(Error::NotAllowed);
        }
        team.set_state(TeamState::Shutdown)?;
        team.lock().set_exit_info(TeamExitInfo {
            status,
            reason,
            signal,
            signaling_user: 0,
        });

        let threads: Vec<Reference<Thread>> = team.lock().threads().to_vec();
        let thread_status = ThreadExitStatus {
            status,
            reason: match reason {
                ChildEvent::Exited => ThreadExitReason::Exited,
                _ => ThreadExitReason::Killed,
            },
            signal,
        };
        for thread in threads {
            self.retire_thread(&team, &thread, thread_status);
        }
        team.delete_user_timers(false);

        if let Some(space) = team.address_space() {
            let areas: Vec<Arc<VmArea>> = space.lock().areas().cloned().collect();
            for area in &areas {
                self.wait_until_unwired(area)?;
            }
        }
        if let Some(space) = team.set_address_space(None) {
            for area in space.remove_all_areas() {
                self.areas.remove(area.id());
                self.release_area_pages(&area);
            }
        }

        let (parent, children, group) = {
            let mut set = TeamLockSet::lock_team_parent_and_process_group(&team);
            set.set_job_control_state(JobControlState::Dead, None);
            let group = remove_team_from_group(&mut set);
            let children = set.detach_from_parent();
            (set.parent().cloned(), children, group)
        };

        if let Some(group) = &group {
            group.schedule_orphaned_check();
        }
        drop(group);
        for child in &children {
            self.kernel_team.insert_child(child);
            let child_group = child.lock().group().cloned();
            if let Some(child_group) = child_group {
                child_group.schedule_orphaned_check();
            }
        }
        if let Some(parent) = parent {
            parent.add_pending_signal(SIGCHLD);
        }

        team.set_state(TeamState::Death)?;
        self.teams.remove(id);
        log::debug!("team {} gone ({} children reparented)", id, children.len());
        Ok(())
    }

    /// Stop a team and report it to its parent
    pub fn stop_team(&self, id: TeamId, sender: TeamId) -> Result<()> {
        self.change_job_control_state(id, JobControlState::Stopped, Signal::new(SIGSTOP, SI_USER, 0, sender))
    }

    /// Continue a stopped team and report it to its parent
    pub fn continue_team(&self, id: TeamId, sender: TeamId) -> Result<()> {
        self.change_job_control_state(id, JobControlState::Continued, Signal::new(SIGCONT, SI_USER, 0, sender))
    }

    fn change_job_control_state(&self, id: TeamId, state: JobControlState, signal: Signal) -> Result<()> {
        let team = self.teams.get(id).ok_or(Error::BadTeamId)?;
        let parent = {
            let mut set = TeamLockSet::lock_team_and_parent(&team, false);
            if set.team_data().state().is_dying() {
                return Err(Error::BadTeamId);
            }
            set.set_job_control_state(state, Some(&signal));
            set.parent().cloned()
        };
        if let Some(parent) = parent {
            parent.add_pending_signal(SIGCHLD);
        }
        Ok(())
    }

    /// Collect a child event of `parent`, like `waitpid`
    pub fn wait_for_child(
        &self,
        parent: TeamId,
        child: i32,
        flags: WaitFlags,
        timeout: Timeout,
    ) -> Result<JobControlEntry> {
        let parent = self.teams.get(parent).ok_or(Error::BadTeamId)?;
        parent.wait_for_child(child, flags, timeout)
    }

    // === Sessions and groups ===

    /// Make `id` the leader of a new session and process group, like `setsid`
    pub fn new_session(&self, id: TeamId) -> Result<SessionId> {
        let team = self.teams.get(id).ok_or(Error::BadTeamId)?;
        if self.groups.get(ProcessGroupId(id.0)).is_some() {
            return Err(Error::NotAllowed);
        }

        let session = ProcessSession::new(SessionId(id.0));
        let group = self.groups.create(ProcessGroupId(id.0));
        group.publish(&session)?;
        self.move_to_group(&team, &group)?;
        log::debug!("team {} leads session {}", id, session.id());
        Ok(session.id())
    }

    /// Move `id` into the process group `group_id`, like `setpgid`
    ///
    /// A group id of zero means the team's own id. A group that does not
    /// exist yet may only be created by its leader; an existing one must be
    /// in the team's session.
    pub fn set_process_group(&self, id: TeamId, group_id: ProcessGroupId) -> Result<ProcessGroupId> {
        let team = self.teams.get(id).ok_or(Error::BadTeamId)?;
        let group_id = if group_id.0 == 0 { ProcessGroupId(id.0) } else { group_id };
        let (current, session_id) = {
            let locked = team.lock();
            (locked.group_id(), locked.session_id())
        };
        if current == group_id {
            return Ok(group_id);
        }

        let group = match self.groups.get(group_id) {
            Some(group) => {
                if group.session_id() != Some(session_id) {
                    return Err(Error::NotAllowed);
                }
                group
            }
            None => {
                if group_id.0 != id.0 {
                    return Err(Error::NotAllowed);
                }
                let current_group = self.groups.get(current).ok_or(Error::BadValue)?;
                let session = current_group.session().cloned().ok_or(Error::BadValue)?;
                drop(current_group);
                let group = self.groups.create(group_id);
                group.publish(&session)?;
                group
            }
        };
        self.move_to_group(&team, &group)?;
        Ok(group_id)
    }

    fn move_to_group(&self, team: &Reference<Team>, group: &Reference<ProcessGroup>) -> Result<()> {
        let old = {
            let mut set = TeamLockSet::lock_team_and_process_group(team);
            remove_team_from_group(&mut set)
        };
        if let Some(old) = &old {
            old.schedule_orphaned_check();
        }
        drop(old);
        ProcessGroup::insert_team(group, team)
    }

    /// Signal orphaned groups queued for a check; returns how many were
    pub fn check_orphaned_process_groups(&self) -> usize {
        self.groups.check_orphaned_process_groups()
    }

    // === Threads ===

    /// Create a thread in team `team` and publish it
    pub fn create_thread(&self, team: TeamId, name: &str) -> Result<Reference<Thread>> {
        let team = self.teams.get(team).ok_or(Error::BadTeamId)?;
        let thread = self.threads.create(name, KernelStack::default())?;
        team.add_thread(&thread)?;
        if let Err(error) = self.threads.insert(&thread) {
            team.remove_thread(thread.id());
            return Err(error);
        }
        log::debug!("thread {} ({}) created in team {}", thread.id(), name, team.id());
        Ok(thread)
    }

    /// End a thread: record its status, drop its timers and detach it
    pub fn exit_thread(&self, id: ThreadId, status: ThreadExitStatus) -> Result<()> {
        let thread = self.threads.get(id).ok_or(Error::BadThreadId)?;
        match thread.team() {
            Some(team) => self.retire_thread(&team, &thread, status),
            None => {
                self.threads.remove(id);
                thread.exit(status);
                thread.delete_user_timers(false);
            }
        }
        Ok(())
    }

    fn retire_thread(&self, team: &Reference<Team>, thread: &Reference<Thread>, status: ThreadExitStatus) {
        self.threads.remove(thread.id());
        thread.exit(status);
        thread.delete_user_timers(false);
        team.remove_thread(thread.id());
    }

    // === Areas ===

    fn address_space_of(&self, team: TeamId) -> Result<Reference<VmAddressSpace>> {
        self.teams
            .get(team)
            .and_then(|team| team.address_space())
            .ok_or(Error::BadTeamId)
    }

    /// Create an anonymous area in `team`'s address space
    ///
    /// The area is placed after the team's last area. Wired areas get all
    /// their pages allocated and mapped up front.
    pub fn create_area(
        &self,
        team: TeamId,
        name: &str,
        size: u64,
        protection: Protection,
        wiring: Wiring,
    ) -> Result<Arc<VmArea>> {
        if size == 0 {
            return Err(Error::BadValue);
        }
        let space = self.address_space_of(team)?;
        let kernel = space.is_kernel();
        let minimum = if kernel { KERNEL_AREA_BASE } else { USER_AREA_BASE };
        let protection = if kernel { protection } else { protection | protection.implied_kernel() };

        let size = page_align(size);
        let id = self.areas.allocate_id();
        let area = space.insert_area_at_free_base(minimum, |base| {
            let spec = AreaSpec {
                name,
                address_space: team,
                kernel,
                base,
                size,
                protection,
                wiring,
                memory_type: MemoryType::default(),
                cache_offset: 0,
            };
            Arc::new(VmArea::new(id, &spec, VmCache::new(CacheType::Ram, true)))
        })?;

        if let Err(error) = self.areas.insert(Arc::clone(&area)) {
            space.remove_area(area.id());
            return Err(error);
        }

        if !wiring.tracks_mappings() {
            let mut address = area.base();
            while address != area.end() {
                if let Err(error) = self.map_area_page(area.id(), address) {
                    self.delete_area(area.id())?;
                    return Err(error);
                }
                address += PAGE_SIZE;
            }
        }
        log::debug!(
            "area {} ({}) created at {:#x}, {:#x} bytes",
            area.id(),
            area.name(),
            area.base(),
            area.size()
        );
        Ok(area)
    }

    /// Back `address` of area `id` with a page and map it
    ///
    /// The page comes from the area's cache, or is allocated into it.
    /// Mapping an already mapped address is a no-op.
    pub fn map_area_page(&self, id: AreaId, address: Addr) -> Result<PageRef> {
        let area = self.areas.lookup(id).ok_or(Error::BadAreaId)?;
        if !area.contains_address(address) {
            return Err(Error::BadValue);
        }
        let space = self.address_space_of(area.address_space())?;
        let address = address & !(PAGE_SIZE - 1);
        let offset = address - area.base() + area.cache_offset();

        let page = {
            let mut cache = area.cache().lock();
            match cache.lookup_page(offset) {
                Some(page) => page.clone(),
                None => {
                    let state = if area.wiring().tracks_mappings() {
                        PageState::Active
                    } else {
                        PageState::Wired
                    };
                    let page = self
                        .pages
                        .allocate_page(Reference::as_arc(area.cache()), state)
                        .ok_or(Error::NoMemory)?;
                    cache.insert_page(offset, page.clone());
                    page
                }
            }
        };

        match map_page(space.translation_map().as_ref(), &area, &page, address, area.protection()) {
            Ok(()) | Err(Error::AlreadyExists) => Ok(page),
            Err(error) => Err(error),
        }
    }

    /// Delete an area, waiting for any wired ranges to be unwired first
    pub fn delete_area(&self, id: AreaId) -> Result<()> {
        let area = self.areas.lookup(id).ok_or(Error::BadAreaId)?;
        self.wait_until_unwired(&area)?;

        if let Ok(space) = self.address_space_of(area.address_space()) {
            space.remove_area(id);
            space.translation_map().unmap_area(&area, false, false);
        }
        self.areas.remove(id);
        self.release_area_pages(&area);
        log::debug!("area {} deleted", id);
        Ok(())
    }

    /// Block until no range of `area` is wired
    fn wait_until_unwired(&self, area: &VmArea) -> Result<()> {
        loop {
            let locker = CacheLocker::lock(area.cache().clone());
            let mut waiter = UnwiredWaiter::new();
            if !area.add_waiter_if_wired(&locker, &mut waiter) {
                return Ok(());
            }
            drop(locker);
            log::trace!("area {}: waiting for wired ranges", area.id());
            waiter.wait(Timeout::Infinite)?;
        }
    }

    /// Free the pages of `area`'s cache that are no longer mapped
    fn release_area_pages(&self, area: &VmArea) {
        let pages = area.cache().lock().take_pages();
        for page in pages {
            let mut page = page.lock();
            if page.is_mapped() {
                continue;
            }
            self.pages.set_page_state(&mut page, PageState::Free);
            page.set_cache(Weak::new());
        }
    }
}

static KERNEL: spin::Once<KernelCore> = spin::Once::new();

/// Install the global kernel core
///
/// Fails with [`Error::AlreadyExists`] on a second call.
pub fn init(config: KernelConfig) -> Result<&'static KernelCore> {
    let core = KernelCore::new(config)?;
    let mut installed = false;
    let kernel = KERNEL.call_once(|| {
        installed = true;
        core
    });
    if installed {
        Ok(kernel)
    } else {
        Err(Error::AlreadyExists)
    }
}

/// The global kernel core
pub fn kernel() -> &'static KernelCore {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => crate::kernel_panic!("kernel core used before init"),
    }
}
