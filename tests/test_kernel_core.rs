//! Integration tests for the kernel core
//!
//! These drive a private `KernelCore` the way the syscall layer would:
//! teams and threads coming and going, areas, wiring and unmapping.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kcore::config::PAGE_SIZE;
use kcore::kern::cpu::Timeout;
use kcore::kern::referenceable::{KernelReferenceable, Reference};
use kcore::kern::signal::{SIGALRM, SIGCHLD};
use kcore::kern::team::{ChildEvent, JobControlState, TeamRegistry, TeamState, WaitFlags, KERNEL_TEAM_ID};
use kcore::kern::thread::{ThreadExitReason, ThreadExitStatus};
use kcore::kern::user_timer::{TimerClock, UserTimer};
use kcore::vm::area::{Protection, WiredRange, Wiring};
use kcore::vm::cache::CacheLocker;
use kcore::vm::page::PageState;
use kcore::vm::TranslationMap;
use kcore::vm::PhysicalPageService;
use kcore::{Error, KernelConfig, KernelCore};

fn core_with(config: KernelConfig) -> KernelCore {
    let core = KernelCore::new(config).expect("kernel core");
    core.pages().add_range(0x2000, 32);
    core
}

fn core() -> KernelCore {
    core_with(KernelConfig::default())
}

fn timer() -> UserTimer {
    UserTimer::new(TimerClock::RealTime, SIGALRM)
}

#[test]
fn test_user_defined_timer_cap_is_system_wide() {
    let core = core_with(KernelConfig {
        max_user_defined_timers: 3,
        ..KernelConfig::default()
    });
    let first = core.create_team(KERNEL_TEAM_ID, "first").unwrap();
    let second = core.create_team(KERNEL_TEAM_ID, "second").unwrap();

    first.add_user_timer(timer()).unwrap();
    first.add_user_timer(timer()).unwrap();
    let id = second.add_user_timer(timer()).unwrap();
    assert_eq!(first.add_user_timer(timer()), Err(Error::NoMoreTimers));
    assert_eq!(second.add_user_timer(timer()), Err(Error::NoMoreTimers));
    assert_eq!(core.teams().limits().user_defined_timers(), 3);

    // A failed attempt leaves no reservation behind
    assert_eq!(first.user_defined_timer_count(), 2);
    assert_eq!(second.user_defined_timer_count(), 1);

    assert!(second.remove_user_timer(id).is_some());
    second.add_user_timer(timer()).unwrap();

    core.exit_team(first.id(), 0, ChildEvent::Exited, 0).unwrap();
    assert_eq!(core.teams().limits().user_defined_timers(), 1);
    assert_eq!(first.add_user_timer(timer()), Err(Error::BadTeamId));
}

#[test]
fn test_timers_until_cap() {
    let core = core_with(KernelConfig {
        max_user_defined_timers: 16,
        ..KernelConfig::default()
    });
    let team = core.create_team(KERNEL_TEAM_ID, "timers").unwrap();
    let thread = core.create_thread(team.id(), "main").unwrap();
    thread.set_priority(10).unwrap();
    assert_eq!(thread.priority(), 10);

    let mut added = 0;
    while team.add_user_timer(timer()).is_ok() {
        added += 1;
    }
    assert_eq!(added, 16);
    assert!(!team.check_add_user_defined_timer());
    assert_eq!(core.teams().limits().user_defined_timers(), 16);
}

#[test]
#[should_panic(expected = "no such range")]
fn test_unwire_of_overlapping_range_is_fatal() {
    let core = core();
    let area = core
        .create_area(KERNEL_TEAM_ID, "buffer", 2 * PAGE_SIZE, Protection::KERNEL_READ, Wiring::FullLock)
        .unwrap();
    let locker = CacheLocker::lock(area.cache().clone());
    area.wire(&locker, WiredRange::new(area.base(), 2 * PAGE_SIZE, true, true));

    // Overlaps the wired range but does not match it
    area.unwire_implicit(&locker, area.base(), PAGE_SIZE, true);
}

#[test]
fn test_get_and_lock_races_with_shutdown() {
    let core = Arc::new(core());
    let team = core.create_team(KERNEL_TEAM_ID, "victim").unwrap();
    let id = team.id();

    let lookups: Vec<_> = (0..4)
        .map(|_| {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                let mut hits = 0usize;
                while let Some(locker) = core.teams().get_and_lock(id) {
                    assert!(!locker.locked().state().is_dying());
                    hits += 1;
                    drop(locker);
                    thread::yield_now();
                }
                hits
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(10));
    team.set_state(TeamState::Shutdown).unwrap();

    for lookup in lookups {
        lookup.join().unwrap();
    }
    assert!(core.teams().get_and_lock(id).is_none());
    // Still published, just no longer handed out locked
    assert!(core.teams().get(id).is_some());
}

#[test]
fn test_areas_through_kernel_core() {
    let core = core();
    let app = core.create_team(KERNEL_TEAM_ID, "app").unwrap();
    let tool = core.create_team(KERNEL_TEAM_ID, "tool").unwrap();

    let heap = core
        .create_area(app.id(), "app heap", PAGE_SIZE, Protection::READ | Protection::WRITE, Wiring::NoLock)
        .unwrap();
    let stack = core
        .create_area(app.id(), "app stack", 2 * PAGE_SIZE, Protection::READ | Protection::WRITE, Wiring::FullLock)
        .unwrap();
    let data = core
        .create_area(tool.id(), "tool data", PAGE_SIZE, Protection::READ, Wiring::NoLock)
        .unwrap();
    assert_eq!(core.areas().count(), 3);
    assert_eq!(core.areas().find("tool data"), Ok(data.id()));

    let app_space = app.address_space().unwrap();
    assert_eq!(app_space.area_count(), 2);
    assert_eq!(app_space.lookup_area(stack.base() + PAGE_SIZE).map(|a| a.id()), Some(stack.id()));
    assert!(tool.address_space().unwrap().lookup_area(stack.base()).is_none());

    // Wired areas come fully populated
    assert_eq!(core.pages().count_in_state(PageState::Wired), 2);
    core.map_area_page(heap.id(), heap.base()).unwrap();
    assert_eq!(
        core.map_area_page(heap.id(), heap.end()).err(),
        Some(Error::BadValue)
    );

    core.exit_team(app.id(), 0, ChildEvent::Exited, 0).unwrap();
    assert!(core.areas().lookup(heap.id()).is_none());
    assert!(core.areas().lookup(stack.id()).is_none());
    assert!(core.areas().lookup(data.id()).is_some());
    assert_eq!(core.pages().count_in_state(PageState::Wired), 0);

    core.delete_area(data.id()).unwrap();
    assert_eq!(core.areas().count(), 0);
    assert_eq!(core.areas().find("tool data"), Err(Error::NameNotFound));
}

#[test]
#[should_panic(expected = "mapping not found")]
fn test_double_page_unmapped_is_fatal() {
    let core = core();
    let team = core.create_team(KERNEL_TEAM_ID, "app").unwrap();
    let area = core
        .create_area(team.id(), "heap", PAGE_SIZE, Protection::READ, Wiring::NoLock)
        .unwrap();
    let page = core.map_area_page(area.id(), area.base()).unwrap();
    let page_number = page.lock().physical_page_number;

    let space = team.address_space().unwrap();
    let map = space.translation_map();
    map.base().lock();
    map.page_unmapped(&area, page_number, false, false, true, None);
    map.base().lock();
    map.page_unmapped(&area, page_number, false, false, true, None);
}

#[test]
fn test_parent_blocks_until_child_exits() {
    let core = Arc::new(core());
    let parent = core.create_team(KERNEL_TEAM_ID, "shell").unwrap();
    let child = core.create_team(parent.id(), "job").unwrap();
    let (parent_id, child_id) = (parent.id(), child.id());

    let waiter = {
        let core = Arc::clone(&core);
        thread::spawn(move || core.wait_for_child(parent_id, child_id.0, WaitFlags::empty(), Timeout::Infinite))
    };
    thread::sleep(Duration::from_millis(10));
    core.exit_team(child_id, 42, ChildEvent::Exited, 0).unwrap();

    let entry = waiter.join().unwrap().unwrap();
    assert_eq!(entry.team, child_id);
    assert_eq!(entry.status, 42);
    assert_eq!(entry.state, JobControlState::Dead);
    assert!(parent.pending_signals().contains(SIGCHLD));

    // Reaped; nothing left to wait for
    assert_eq!(
        core.wait_for_child(parent_id, -1, WaitFlags::NO_HANG, Timeout::Infinite),
        Err(Error::EntryNotFound)
    );
}

#[test]
fn test_thread_exit_wakes_joiner() {
    let core = Arc::new(core());
    let team = core.create_team(KERNEL_TEAM_ID, "app").unwrap();
    let worker = core.create_thread(team.id(), "worker").unwrap();

    let joiner = {
        let worker = worker.clone();
        thread::spawn(move || worker.wait_for_exit(Timeout::Infinite))
    };
    thread::sleep(Duration::from_millis(10));
    core.exit_thread(
        worker.id(),
        ThreadExitStatus {
            status: 9,
            reason: ThreadExitReason::Exited,
            signal: 0,
        },
    )
    .unwrap();

    let status = joiner.join().unwrap().unwrap();
    assert_eq!(status.status, 9);
    assert_eq!(team.thread_count(), 0);
    assert!(core.threads().get(worker.id()).is_none());
}

#[test]
fn test_get_and_lock_races_final_release() {
    let teams = Arc::new(TeamRegistry::new(&KernelConfig::default()));
    teams.bootstrap().unwrap();
    let team = teams.create("victim").unwrap();
    team.set_state(TeamState::Normal).unwrap();
    teams.insert(&team).unwrap();
    team.add_user_timer(timer()).unwrap();
    let (id, weak) = (team.id(), Reference::downgrade(&team));
    assert_eq!(teams.limits().user_defined_timers(), 1);

    let lookups: Vec<_> = (0..4)
        .map(|n| {
            let teams = Arc::clone(&teams);
            let weak = weak.clone();
            thread::spawn(move || loop {
                if n % 2 == 0 {
                    let Some(locker) = teams.get_and_lock(id) else { break };
                    assert!(locker.reference_count().count() >= 1);
                    // Not released while we hold it
                    assert_eq!(teams.limits().user_defined_timers(), 1);
                } else {
                    let Some(reference) = Reference::upgrade(&weak) else { break };
                    assert!(reference.reference_count().count() >= 1);
                    assert_eq!(teams.limits().user_defined_timers(), 1);
                }
                thread::yield_now();
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    drop(team);
    drop(teams.remove(id));

    for lookup in lookups {
        lookup.join().unwrap();
    }
    assert!(teams.get_and_lock(id).is_none());
    assert!(Reference::upgrade(&weak).is_none());
    // The release hook ran once and gave the timer reservation back
    assert_eq!(teams.limits().user_defined_timers(), 0);
}

#[test]
fn test_exit_team_waits_for_wired_ranges() {
    let core = Arc::new(core());
    let team = core.create_team(KERNEL_TEAM_ID, "io").unwrap();
    let area = core
        .create_area(team.id(), "buffer", PAGE_SIZE, Protection::READ | Protection::WRITE, Wiring::NoLock)
        .unwrap();
    let page = core.map_area_page(area.id(), area.base()).unwrap();
    let wired = {
        let locker = CacheLocker::lock(area.cache().clone());
        area.wire(&locker, WiredRange::new(area.base(), PAGE_SIZE, true, false))
    };

    let exiting = {
        let core = Arc::clone(&core);
        let id = team.id();
        thread::spawn(move || core.exit_team(id, 0, ChildEvent::Exited, 0))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(core.areas().lookup(area.id()).is_some());
    assert_ne!(page.lock().state, PageState::Free);
    assert!(page.lock().is_mapped());

    {
        let locker = CacheLocker::lock(area.cache().clone());
        area.unwire(&locker, wired);
        assert!(!area.is_wired(&locker));
    }
    exiting.join().unwrap().unwrap();
    assert!(core.areas().lookup(area.id()).is_none());
    assert_eq!(page.lock().state, PageState::Free);
    assert_eq!(team.state(), TeamState::Death);
}

#[test]
fn test_children_of_kernel_team_leave_no_death_entries() {
    let core = core();
    for n in 0..5 {
        let team = core.create_team(KERNEL_TEAM_ID, &format!("daemon {}", n)).unwrap();
        core.exit_team(team.id(), n, ChildEvent::Exited, 0).unwrap();
    }

    // Reparented children are reaped the same way
    let shell = core.create_team(KERNEL_TEAM_ID, "shell").unwrap();
    let job = core.create_team(shell.id(), "job").unwrap();
    core.exit_team(shell.id(), 0, ChildEvent::Exited, 0).unwrap();
    assert_eq!(job.lock().parent_id(), Some(KERNEL_TEAM_ID));
    core.exit_team(job.id(), 0, ChildEvent::Exited, 0).unwrap();

    assert_eq!(core.kernel_team().lock().dead_children.count, 0);
    assert_eq!(
        core.wait_for_child(KERNEL_TEAM_ID, -1, WaitFlags::NO_HANG, Timeout::Infinite),
        Err(Error::EntryNotFound)
    );
}

#[test]
fn test_concurrent_map_of_same_page() {
    let core = Arc::new(core());
    let team = core.create_team(KERNEL_TEAM_ID, "app").unwrap();
    let area = core
        .create_area(team.id(), "heap", PAGE_SIZE, Protection::READ, Wiring::NoLock)
        .unwrap();

    let mappers: Vec<_> = (0..4)
        .map(|_| {
            let core = Arc::clone(&core);
            let (id, address) = (area.id(), area.base());
            thread::spawn(move || {
                (0..50)
                    .map(|_| core.map_area_page(id, address).unwrap())
                    .last()
            })
        })
        .collect();
    let pages: Vec<_> = mappers
        .into_iter()
        .filter_map(|mapper| mapper.join().unwrap())
        .collect();

    assert!(pages.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(pages[0].lock().mappings.len(), 1);
    assert_eq!(area.mapping_count(), 1);
    assert_eq!(core.pages().mapped_pages(), 1);
    let space = team.address_space().unwrap();
    assert_eq!(space.translation_map().mapped_size(), PAGE_SIZE);

    core.delete_area(area.id()).unwrap();
    assert_eq!(core.pages().mapped_pages(), 0);
    assert_eq!(pages[0].lock().state, PageState::Free);
}

#[test]
fn test_concurrent_area_creation_in_one_team() {
    let core = Arc::new(core());
    let team = core.create_team(KERNEL_TEAM_ID, "app").unwrap();

    let creators: Vec<_> = (0..4)
        .map(|n| {
            let core = Arc::clone(&core);
            let id = team.id();
            thread::spawn(move || {
                (0..8)
                    .map(|i| {
                        core.create_area(id, &format!("area {}.{}", n, i), PAGE_SIZE, Protection::READ, Wiring::NoLock)
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut areas: Vec<_> = creators
        .into_iter()
        .flat_map(|creator| creator.join().unwrap())
        .collect();

    assert_eq!(areas.len(), 32);
    assert_eq!(team.address_space().unwrap().area_count(), 32);
    areas.sort_by_key(|area| area.base());
    assert!(areas.windows(2).all(|pair| pair[0].end() <= pair[1].base()));
}
