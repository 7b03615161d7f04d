//! Message passing between tasks

mod common;

use common::start_exec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tek_exec::{ack_msg, drop_msg, reply_msg, Envelope, MsgId, MsgStatus, TaskBuilder};

const PRODUCERS: u32 = 4;
const PER_PRODUCER: u32 = 200;

#[test]
fn test_fifo_per_producer() {
    let exec = start_exec();
    let main = exec.main_task();
    let port = main.create_port().unwrap();

    let children: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let port = port.clone();
            main.create_task(TaskBuilder::new().run(move |_| {
                for seq in 0..PER_PRODUCER {
                    port.put(None, Envelope::new((producer, seq)));
                }
            }))
            .unwrap()
        })
        .collect();

    let mut last: HashMap<u32, u32> = HashMap::new();
    let mut received = 0;
    while received < PRODUCERS * PER_PRODUCER {
        port.wait();
        while let Some(msg) = port.get() {
            let (producer, seq) = msg.downcast::<(u32, u32)>().unwrap().into_body();
            if let Some(prev) = last.insert(producer, seq) {
                assert_eq!(seq, prev + 1, "producer {producer} out of order");
            } else {
                assert_eq!(seq, 0);
            }
            received += 1;
        }
    }
    assert!(port.is_empty());
    for child in &children {
        main.destroy_task(child).unwrap();
    }
}

#[test]
fn test_return_statuses() {
    let exec = start_exec();
    let main = exec.main_task();
    let server = main
        .create_task(TaskBuilder::new().name("status-server").run(|task| {
            let port = task.user_port();
            for _ in 0..3 {
                port.wait();
                let msg = port.get().unwrap().downcast::<&'static str>().unwrap();
                match msg.body {
                    "reply" => reply_msg(msg),
                    "ack" => ack_msg(msg),
                    _ => drop_msg(msg),
                }
            }
        }))
        .unwrap();

    for (body, want) in [
        ("reply", MsgStatus::Replied),
        ("ack", MsgStatus::Acked),
        ("drop", MsgStatus::Failed),
    ] {
        let (status, msg) = main.send_msg(server.user_port(), Envelope::new(body));
        assert_eq!(status, want);
        assert_eq!(msg.body, body);
        assert_eq!(msg.sender(), Some(main.id()));
    }
    main.destroy_task(&server).unwrap();
}

#[test]
fn test_message_payload_round_trip() {
    let exec = start_exec();
    let main = exec.main_task();
    let worker = main
        .create_task(TaskBuilder::new().run(|task| {
            let port = task.user_port();
            port.wait();
            let mut msg = port.get().unwrap().downcast::<tek_exec::MemBlock>().unwrap();
            for (i, byte) in msg.body.as_mut_slice().iter_mut().enumerate() {
                *byte = i as u8;
            }
            reply_msg(msg);
        }))
        .unwrap();

    let msg = main.alloc_msg(64).unwrap();
    assert!(msg.body.as_slice().iter().all(|b| *b == 0));
    assert_eq!(exec.msg_manager().outstanding(), Some(1));

    let (status, msg) = main.send_msg(worker.user_port(), msg);
    assert_eq!(status, MsgStatus::Replied);
    assert_eq!(msg.body.as_slice()[63], 63);
    drop(msg);
    assert_eq!(exec.msg_manager().outstanding(), Some(0));
    main.destroy_task(&worker).unwrap();
}

#[test]
fn test_hook_counts_arrivals() {
    let exec = start_exec();
    let port = exec.main_task().create_port().unwrap();
    let arrivals = Arc::new(AtomicUsize::new(0));
    let counter = arrivals.clone();
    assert!(port
        .set_hook(Some(Arc::new(move |_: &Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .is_none());

    for i in 0..3 {
        port.put(None, Envelope::new(i));
    }
    assert_eq!(arrivals.load(Ordering::SeqCst), 3);
    assert!(port.set_hook(None).is_some());
    port.put(None, Envelope::new(3));
    assert_eq!(arrivals.load(Ordering::SeqCst), 3);
    while port.get().is_some() {}
}

#[test]
fn test_reply_to_other_port() {
    let exec = start_exec();
    let main = exec.main_task();
    let inbox = main.create_port().unwrap();
    let replies = main.create_port().unwrap();

    let mut ids: Vec<MsgId> = Vec::new();
    for i in 0..3u8 {
        let msg = Envelope::new(i);
        ids.push(msg.id());
        inbox.put(Some(replies.clone()), msg);
    }
    // answer out of order; replies arrive in answer order
    let second = inbox.remove(ids[1]).unwrap();
    reply_msg(second);
    while let Some(msg) = inbox.get() {
        ack_msg(msg);
    }
    let order: Vec<(MsgId, MsgStatus)> = std::iter::from_fn(|| replies.get())
        .map(|msg| (msg.id(), msg.status()))
        .collect();
    assert_eq!(
        order,
        vec![
            (ids[1], MsgStatus::Replied),
            (ids[0], MsgStatus::Acked),
            (ids[2], MsgStatus::Acked),
        ]
    );
    assert!(replies.get().is_none());
}
