//! Atom locking across tasks

mod common;

use common::{start_exec, wait_until};
use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tek_exec::{AtomMode, TaskBuilder};

#[test]
fn test_exclusive_waiters_granted_in_order() {
    let exec = start_exec();
    let main = exec.main_task();
    let atom = main.lock_atom("fifo", AtomMode::CREATE).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut children = Vec::new();
    for index in 0..4usize {
        let order = order.clone();
        let child = main
            .create_task(TaskBuilder::new().run(move |task| {
                let atom = task.lock_atom("fifo", AtomMode::EXCLUSIVE).unwrap();
                order.lock().push(index);
                task.unlock_atom(&atom, AtomMode::EXCLUSIVE);
            }))
            .unwrap();
        assert!(wait_until(|| exec.atom_waiters("fifo") == index + 1));
        children.push(child);
    }

    main.unlock_atom(&atom, AtomMode::EXCLUSIVE);
    for child in &children {
        main.destroy_task(child).unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn test_shared_waiters_released_together() {
    let exec = start_exec();
    let main = exec.main_task();
    let atom = main.lock_atom("readers", AtomMode::CREATE).unwrap();
    // every reader must hold the lock at once to pass the barrier
    let barrier = Arc::new(Barrier::new(3));

    let mut children = Vec::new();
    for index in 0..3usize {
        let barrier = barrier.clone();
        let child = main
            .create_task(TaskBuilder::new().run(move |task| {
                let atom = task.lock_atom("readers", AtomMode::SHARED).unwrap();
                barrier.wait();
                task.unlock_atom(&atom, AtomMode::SHARED);
            }))
            .unwrap();
        assert!(wait_until(|| exec.atom_waiters("readers") == index + 1));
        children.push(child);
    }

    main.unlock_atom(&atom, AtomMode::EXCLUSIVE);
    for child in &children {
        main.destroy_task(child).unwrap();
    }
    let again = main.lock_atom("readers", AtomMode::TRY).unwrap();
    main.unlock_atom(&again, AtomMode::EXCLUSIVE);
}

#[test]
fn test_try_never_blocks() {
    let exec = start_exec();
    let main = exec.main_task();
    assert!(main.lock_atom("absent", AtomMode::TRY).is_none());

    let atom = main.lock_atom("busy", AtomMode::CREATE).unwrap();
    let (tx, rx) = channel::bounded(2);
    let child = main
        .create_task(TaskBuilder::new().run(move |task| {
            tx.send(task.lock_atom("busy", AtomMode::TRY).is_none()).unwrap();
            tx.send(task.lock_atom("busy", AtomMode::CREATE | AtomMode::TRY).is_none())
                .unwrap();
        }))
        .unwrap();
    assert!(rx.recv().unwrap());
    assert!(rx.recv().unwrap());
    main.destroy_task(&child).unwrap();

    // the owner nests instead
    let nested = main.lock_atom(&atom, AtomMode::TRY).unwrap();
    assert!(Arc::ptr_eq(&atom, &nested));
    main.unlock_atom(&nested, AtomMode::EXCLUSIVE);
    main.unlock_atom(&atom, AtomMode::EXCLUSIVE);
    assert_eq!(exec.atom_count(), 1);
}

#[test]
fn test_destroy_fails_waiters() {
    let exec = start_exec();
    let main = exec.main_task();
    let atom = main.lock_atom("doomed", AtomMode::CREATE).unwrap();

    let (tx, rx) = channel::bounded(1);
    let child = main
        .create_task(TaskBuilder::new().run(move |task| {
            tx.send(task.lock_atom("doomed", AtomMode::EXCLUSIVE).is_none())
                .unwrap();
        }))
        .unwrap();
    assert!(wait_until(|| exec.atom_waiters("doomed") == 1));

    main.unlock_atom(&atom, AtomMode::DESTROY);
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(exec.atom_count(), 0);
    // the old handle no longer refers to a live atom
    assert!(main.lock_atom(&atom, AtomMode::EXCLUSIVE).is_none());
    main.destroy_task(&child).unwrap();
}

#[test]
fn test_lock_with_destroy_releases_name() {
    let exec = start_exec();
    let main = exec.main_task();
    let atom = main
        .lock_atom("scratch", AtomMode::CREATE | AtomMode::DESTROY)
        .unwrap();
    assert_eq!(atom.name(), "scratch");
    assert_eq!(exec.atom_count(), 0);
}

#[test]
fn test_atom_data() {
    let exec = start_exec();
    let main = exec.main_task();
    let atom = main.lock_atom("config", AtomMode::CREATE).unwrap();
    assert!(atom.set_data(Some(Arc::new(42u32))).is_none());
    main.unlock_atom(&atom, AtomMode::EXCLUSIVE);

    let (tx, rx) = channel::bounded(1);
    let child = main
        .create_task(TaskBuilder::new().run(move |task| {
            let atom = task.lock_atom("config", AtomMode::SHARED).unwrap();
            let value = atom.data().and_then(|d| d.downcast_ref::<u32>().copied());
            task.unlock_atom(&atom, AtomMode::SHARED);
            tx.send(value).unwrap();
        }))
        .unwrap();
    assert_eq!(rx.recv().unwrap(), Some(42));
    main.destroy_task(&child).unwrap();
}
